use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Executed trade count and realised P&L for one day, per instrument or global
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyTradeCounter {
    pub date: NaiveDate,
    pub trades: u32,
    /// Signed net of every fill
    pub realized_pnl: Decimal,
    /// Sum of losing fills only; gains never offset it
    #[serde(default)]
    pub realized_loss: Decimal,
}

impl DailyTradeCounter {
    pub fn empty(date: NaiveDate) -> Self {
        Self {
            date,
            trades: 0,
            realized_pnl: Decimal::ZERO,
            realized_loss: Decimal::ZERO,
        }
    }

    /// Gross realised loss today, as a non-negative amount
    pub fn realized_loss(&self) -> Decimal {
        self.realized_loss
    }

    pub fn record(&mut self, pnl: Decimal) {
        self.trades += 1;
        self.realized_pnl += pnl;
        if pnl < Decimal::ZERO {
            self.realized_loss += pnl.abs();
        }
    }
}

/// Open long position in one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenPosition {
    pub symbol: String,
    pub amount: Decimal,
    pub entry_price: Decimal,
    /// Highest price seen since entry, for trailing stops
    pub peak_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl OpenPosition {
    pub fn unrealized_pnl_percent(&self, price: Decimal) -> Decimal {
        if self.entry_price.is_zero() {
            return Decimal::ZERO;
        }
        (price - self.entry_price) / self.entry_price * Decimal::ONE_HUNDRED
    }

    /// Percent drop from the peak price
    pub fn drawdown_from_peak_percent(&self, price: Decimal) -> Decimal {
        let peak = self.peak_price.max(price);
        if peak.is_zero() {
            return Decimal::ZERO;
        }
        (peak - price) / peak * Decimal::ONE_HUNDRED
    }

    pub fn market_value(&self, price: Decimal) -> Decimal {
        self.amount * price
    }
}

/// Portfolio-wide state at the moment a risk check runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Cash plus marked value of every position
    pub total_value: Decimal,
    /// Highest total value recorded
    pub peak_value: Decimal,
    pub cash_balance: Decimal,
    /// Trades and realised P&L across all instruments today
    pub global_today: DailyTradeCounter,
    /// Marked value of each instrument's position
    pub instrument_values: HashMap<String, Decimal>,
    pub taken_at: DateTime<Utc>,
}

impl PortfolioSnapshot {
    pub fn flat(balance: Decimal, date: NaiveDate) -> Self {
        Self {
            total_value: balance,
            peak_value: balance,
            cash_balance: balance,
            global_today: DailyTradeCounter::empty(date),
            instrument_values: HashMap::new(),
            taken_at: Utc::now(),
        }
    }

    pub fn drawdown_percent(&self) -> Decimal {
        if self.peak_value <= Decimal::ZERO || self.total_value >= self.peak_value {
            return Decimal::ZERO;
        }
        (self.peak_value - self.total_value) / self.peak_value * Decimal::ONE_HUNDRED
    }

    pub fn instrument_value(&self, symbol: &str) -> Decimal {
        self.instrument_values
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[test]
    fn test_realized_loss_only_counts_losses() {
        let mut counter = DailyTradeCounter::empty(today());
        counter.record(dec!(25));
        assert_eq!(counter.realized_loss(), Decimal::ZERO);
        counter.record(dec!(-40));
        assert_eq!(counter.trades, 2);
        assert_eq!(counter.realized_pnl, dec!(-15));
        assert_eq!(counter.realized_loss(), dec!(40));
    }

    #[test]
    fn test_earlier_win_does_not_offset_loss() {
        let mut counter = DailyTradeCounter::empty(today());
        counter.record(dec!(100));
        counter.record(dec!(-60));
        assert_eq!(counter.realized_pnl, dec!(40));
        assert_eq!(counter.realized_loss(), dec!(60));
    }

    #[test]
    fn test_position_pnl() {
        let pos = OpenPosition {
            symbol: "X/USD".into(),
            amount: dec!(2),
            entry_price: dec!(100),
            peak_price: dec!(120),
            opened_at: Utc::now(),
        };
        assert_eq!(pos.unrealized_pnl_percent(dec!(95)), dec!(-5));
        assert_eq!(pos.drawdown_from_peak_percent(dec!(108)), dec!(10));
    }

    #[test]
    fn test_drawdown() {
        let mut snap = PortfolioSnapshot::flat(dec!(10000), today());
        snap.total_value = dec!(8000);
        assert_eq!(snap.drawdown_percent(), dec!(20));
    }
}
