use async_trait::async_trait;
use chrono::NaiveDate;
use rust_decimal::Decimal;

use crate::domain::{DailyTradeCounter, OpenPosition, PortfolioSnapshot};
use crate::error::Result;

/// Read side of the trade record that risk checks are evaluated against
#[async_trait]
pub trait TradeHistory: Send + Sync {
    /// Trades and realised P&L for one instrument on `date`
    async fn daily_counter(&self, symbol: &str, date: NaiveDate) -> Result<DailyTradeCounter>;

    /// Portfolio-wide valuation plus the global counter for `date`
    async fn portfolio_snapshot(&self, date: NaiveDate) -> Result<PortfolioSnapshot>;

    async fn open_position(&self, symbol: &str) -> Result<Option<OpenPosition>>;

    /// Record the latest observed price so valuations and trailing peaks move.
    async fn mark_price(&self, _symbol: &str, _price: Decimal) -> Result<()> {
        Ok(())
    }
}
