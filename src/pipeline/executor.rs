//! Order execution and the paper ledger
//!
//! `PaperExecutor` fills approved intents at the intent price against a
//! `PaperLedger`, which doubles as the `TradeHistory` the risk gate reads.
//! Fills can be journalled durably and replayed on startup.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::history::TradeHistory;
use crate::domain::{
    Action, DailyTradeCounter, ExitTrigger, OpenPosition, PortfolioSnapshot, TradeIntent,
};
use crate::error::{ExecutionError, Result};

/// One executed trade
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub intent_id: Uuid,
    pub symbol: String,
    pub action: Action,
    pub price: Decimal,
    pub amount: Decimal,
    pub notional: Decimal,
    /// Zero for entries; exit P&L against the average entry for sells
    pub realized_pnl: Decimal,
    pub exit: Option<ExitTrigger>,
    pub paper: bool,
    pub filled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub fill: Fill,
    pub cash_balance: Decimal,
    pub position: Option<OpenPosition>,
}

#[async_trait]
pub trait Executor: Send + Sync {
    fn is_paper(&self) -> bool;

    /// Execute an approved BUY/SELL intent. Non-actionable intents are errors.
    async fn submit(&self, intent: &TradeIntent) -> Result<ExecutionReport>;
}

/// Append-only record of fills
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FillJournal: Send + Sync {
    async fn record_fill(&self, fill: &Fill) -> Result<()>;

    async fn fills_on(&self, date: NaiveDate) -> Result<Vec<Fill>>;
}

// ==================== Paper ledger ====================

#[derive(Debug)]
struct LedgerState {
    cash: Decimal,
    positions: HashMap<String, OpenPosition>,
    marks: HashMap<String, Decimal>,
    daily: HashMap<(NaiveDate, String), DailyTradeCounter>,
    global_daily: HashMap<NaiveDate, DailyTradeCounter>,
    peak_value: Decimal,
}

impl LedgerState {
    fn mark(&self, symbol: &str, fallback: Decimal) -> Decimal {
        self.marks.get(symbol).copied().unwrap_or(fallback)
    }

    fn instrument_values(&self) -> HashMap<String, Decimal> {
        self.positions
            .iter()
            .map(|(sym, p)| (sym.clone(), p.market_value(self.mark(sym, p.entry_price))))
            .collect()
    }

    fn total_value(&self) -> Decimal {
        self.cash + self.instrument_values().values().copied().sum::<Decimal>()
    }

    fn refresh_peak(&mut self) {
        let total = self.total_value();
        if total > self.peak_value {
            self.peak_value = total;
        }
    }

    /// Move cash and positions for one fill; returns realised P&L.
    fn apply_position(
        &mut self,
        symbol: &str,
        action: Action,
        price: Decimal,
        amount: Decimal,
        at: DateTime<Utc>,
    ) -> std::result::Result<Decimal, ExecutionError> {
        match action {
            Action::Buy => {
                let cost = amount * price;
                if cost > self.cash {
                    return Err(ExecutionError::InsufficientBalance {
                        available: self.cash,
                        required: cost,
                    });
                }
                self.cash -= cost;
                let position = self
                    .positions
                    .entry(symbol.to_string())
                    .or_insert_with(|| OpenPosition {
                        symbol: symbol.to_string(),
                        amount: Decimal::ZERO,
                        entry_price: price,
                        peak_price: price,
                        opened_at: at,
                    });
                let held = position.amount + amount;
                position.entry_price =
                    (position.amount * position.entry_price + amount * price) / held;
                position.amount = held;
                position.peak_price = position.peak_price.max(price);
                Ok(Decimal::ZERO)
            }
            Action::Sell => {
                let Some(position) = self.positions.get_mut(symbol).filter(|p| !p.amount.is_zero())
                else {
                    return Err(ExecutionError::NoPosition {
                        symbol: symbol.to_string(),
                    });
                };
                let qty = amount.min(position.amount);
                let pnl = (price - position.entry_price) * qty;
                position.amount -= qty;
                self.cash += qty * price;
                if position.amount.is_zero() {
                    self.positions.remove(symbol);
                }
                Ok(pnl)
            }
            Action::Hold => Ok(Decimal::ZERO),
        }
    }

    fn record_counters(&mut self, fill: &Fill) {
        let date = fill.filled_at.date_naive();
        self.daily
            .entry((date, fill.symbol.clone()))
            .or_insert_with(|| DailyTradeCounter::empty(date))
            .record(fill.realized_pnl);
        self.global_daily
            .entry(date)
            .or_insert_with(|| DailyTradeCounter::empty(date))
            .record(fill.realized_pnl);
        self.marks.insert(fill.symbol.clone(), fill.price);
        self.refresh_peak();
    }
}

/// In-memory cash, positions and daily counters
#[derive(Debug, Clone)]
pub struct PaperLedger {
    state: Arc<RwLock<LedgerState>>,
    starting_balance: Decimal,
}

impl PaperLedger {
    pub fn new(starting_balance: Decimal) -> Self {
        Self {
            state: Arc::new(RwLock::new(LedgerState {
                cash: starting_balance,
                positions: HashMap::new(),
                marks: HashMap::new(),
                daily: HashMap::new(),
                global_daily: HashMap::new(),
                peak_value: starting_balance,
            })),
            starting_balance,
        }
    }

    pub fn starting_balance(&self) -> Decimal {
        self.starting_balance
    }

    pub async fn cash(&self) -> Decimal {
        self.state.read().await.cash
    }

    pub async fn positions(&self) -> Vec<OpenPosition> {
        self.state.read().await.positions.values().cloned().collect()
    }

    /// Apply an approved intent as a fill at the intent price.
    pub async fn execute(&self, intent: &TradeIntent, paper: bool) -> Result<ExecutionReport> {
        let now = Utc::now();
        let mut state = self.state.write().await;
        let realized_pnl =
            state.apply_position(&intent.symbol, intent.action, intent.price, intent.amount, now)?;
        let fill = Fill {
            intent_id: intent.id,
            symbol: intent.symbol.clone(),
            action: intent.action,
            price: intent.price,
            amount: intent.amount,
            notional: intent.amount * intent.price,
            realized_pnl,
            exit: intent.exit,
            paper,
            filled_at: now,
        };
        state.record_counters(&fill);

        Ok(ExecutionReport {
            position: state.positions.get(&intent.symbol).cloned(),
            cash_balance: state.cash,
            fill,
        })
    }

    /// Rebuild state from journalled fills. Sells without a matching position
    /// (opened before the replay window) still count toward the daily limits.
    pub async fn replay(&self, fills: &[Fill]) -> usize {
        let mut state = self.state.write().await;
        for fill in fills {
            if let Err(e) = state.apply_position(
                &fill.symbol,
                fill.action,
                fill.price,
                fill.amount,
                fill.filled_at,
            ) {
                debug!(symbol = %fill.symbol, "Replay position skipped: {}", e);
            }
            state.record_counters(fill);
        }
        if !fills.is_empty() {
            info!(fills = fills.len(), cash = %state.cash, "Replayed journalled fills");
        }
        fills.len()
    }
}

#[async_trait]
impl TradeHistory for PaperLedger {
    async fn daily_counter(&self, symbol: &str, date: NaiveDate) -> Result<DailyTradeCounter> {
        let state = self.state.read().await;
        Ok(state
            .daily
            .get(&(date, symbol.to_string()))
            .cloned()
            .unwrap_or_else(|| DailyTradeCounter::empty(date)))
    }

    async fn portfolio_snapshot(&self, date: NaiveDate) -> Result<PortfolioSnapshot> {
        let state = self.state.read().await;
        let total_value = state.total_value();
        Ok(PortfolioSnapshot {
            total_value,
            peak_value: state.peak_value.max(total_value),
            cash_balance: state.cash,
            global_today: state
                .global_daily
                .get(&date)
                .cloned()
                .unwrap_or_else(|| DailyTradeCounter::empty(date)),
            instrument_values: state.instrument_values(),
            taken_at: Utc::now(),
        })
    }

    async fn open_position(&self, symbol: &str) -> Result<Option<OpenPosition>> {
        Ok(self.state.read().await.positions.get(symbol).cloned())
    }

    async fn mark_price(&self, symbol: &str, price: Decimal) -> Result<()> {
        if price <= Decimal::ZERO {
            return Ok(());
        }
        let mut state = self.state.write().await;
        state.marks.insert(symbol.to_string(), price);
        if let Some(position) = state.positions.get_mut(symbol) {
            position.peak_price = position.peak_price.max(price);
        }
        state.refresh_peak();
        Ok(())
    }
}

// ==================== Paper executor ====================

pub struct PaperExecutor {
    ledger: PaperLedger,
    journal: Option<Arc<dyn FillJournal>>,
}

impl PaperExecutor {
    pub fn new(ledger: PaperLedger) -> Self {
        Self {
            ledger,
            journal: None,
        }
    }

    pub fn with_journal(mut self, journal: Arc<dyn FillJournal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn ledger(&self) -> &PaperLedger {
        &self.ledger
    }
}

#[async_trait]
impl Executor for PaperExecutor {
    fn is_paper(&self) -> bool {
        true
    }

    async fn submit(&self, intent: &TradeIntent) -> Result<ExecutionReport> {
        if !intent.is_actionable() || intent.amount <= Decimal::ZERO {
            return Err(ExecutionError::NotActionable {
                intent_id: intent.id.to_string(),
                reason: format!("{} {}", intent.verdict, intent.action),
            }
            .into());
        }
        if intent.price <= Decimal::ZERO {
            return Err(ExecutionError::InvalidPrice(intent.price).into());
        }

        let report = self.ledger.execute(intent, true).await?;
        info!(
            symbol = %intent.symbol,
            action = %intent.action,
            amount = %report.fill.amount,
            price = %report.fill.price,
            pnl = %report.fill.realized_pnl,
            "📝 Paper fill"
        );

        if let Some(journal) = &self.journal {
            if let Err(e) = journal.record_fill(&report.fill).await {
                warn!(symbol = %intent.symbol, "Failed to journal fill: {}", e);
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RiskReason;
    use crate::error::QuorumError;
    use rust_decimal_macros::dec;

    const SYM: &str = "X/USD";

    fn intent(action: Action, price: Decimal, amount: Decimal) -> TradeIntent {
        TradeIntent::new(SYM, action, price, action.score()).approve(amount, amount * price)
    }

    fn today() -> NaiveDate {
        Utc::now().date_naive()
    }

    #[tokio::test]
    async fn test_buy_then_sell_realizes_pnl() {
        let ledger = PaperLedger::new(dec!(10000));
        let exec = PaperExecutor::new(ledger.clone());

        exec.submit(&intent(Action::Buy, dec!(100), dec!(2))).await.unwrap();
        assert_eq!(ledger.cash().await, dec!(9800));

        let report = exec.submit(&intent(Action::Sell, dec!(90), dec!(2))).await.unwrap();
        assert_eq!(report.fill.realized_pnl, dec!(-20));
        assert!(report.position.is_none());
        assert_eq!(ledger.cash().await, dec!(9980));

        let counter = ledger.daily_counter(SYM, today()).await.unwrap();
        assert_eq!(counter.trades, 2);
        assert_eq!(counter.realized_loss(), dec!(20));

        let snap = ledger.portfolio_snapshot(today()).await.unwrap();
        assert_eq!(snap.global_today.trades, 2);
        assert_eq!(snap.total_value, dec!(9980));
        assert_eq!(snap.peak_value, dec!(10000));
    }

    #[tokio::test]
    async fn test_average_entry_and_peak() {
        let ledger = PaperLedger::new(dec!(10000));
        let exec = PaperExecutor::new(ledger.clone());
        exec.submit(&intent(Action::Buy, dec!(100), dec!(1))).await.unwrap();
        exec.submit(&intent(Action::Buy, dec!(200), dec!(1))).await.unwrap();

        let pos = ledger.open_position(SYM).await.unwrap().unwrap();
        assert_eq!(pos.amount, dec!(2));
        assert_eq!(pos.entry_price, dec!(150));

        ledger.mark_price(SYM, dec!(260)).await.unwrap();
        let pos = ledger.open_position(SYM).await.unwrap().unwrap();
        assert_eq!(pos.peak_price, dec!(260));

        let snap = ledger.portfolio_snapshot(today()).await.unwrap();
        assert_eq!(snap.instrument_value(SYM), dec!(520));
    }

    #[tokio::test]
    async fn test_sell_without_position_fails() {
        let exec = PaperExecutor::new(PaperLedger::new(dec!(1000)));
        let err = exec
            .submit(&intent(Action::Sell, dec!(100), dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::Execution(_)));
    }

    #[tokio::test]
    async fn test_insufficient_cash() {
        let exec = PaperExecutor::new(PaperLedger::new(dec!(50)));
        let err = exec
            .submit(&intent(Action::Buy, dec!(100), dec!(1)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Insufficient balance"));
    }

    #[tokio::test]
    async fn test_rejected_intent_is_not_submitted() {
        let exec = PaperExecutor::new(PaperLedger::new(dec!(1000)));
        let rejected = TradeIntent::new(SYM, Action::Buy, dec!(10), dec!(1))
            .reject(RiskReason::DailyTradeLimit, String::new());
        assert!(exec.submit(&rejected).await.is_err());
        assert_eq!(exec.ledger().cash().await, dec!(1000));
    }

    #[tokio::test]
    async fn test_fills_are_journalled() {
        let mut journal = MockFillJournal::new();
        journal
            .expect_record_fill()
            .withf(|f| f.symbol == SYM && f.paper)
            .times(1)
            .returning(|_| Ok(()));
        let exec = PaperExecutor::new(PaperLedger::new(dec!(1000))).with_journal(Arc::new(journal));
        exec.submit(&intent(Action::Buy, dec!(10), dec!(1))).await.unwrap();
    }

    #[tokio::test]
    async fn test_journal_failure_keeps_fill() {
        let mut journal = MockFillJournal::new();
        journal
            .expect_record_fill()
            .returning(|_| Err(QuorumError::Internal("db down".into())));
        let exec = PaperExecutor::new(PaperLedger::new(dec!(1000))).with_journal(Arc::new(journal));
        assert!(exec.submit(&intent(Action::Buy, dec!(10), dec!(1))).await.is_ok());
        assert_eq!(exec.ledger().cash().await, dec!(990));
    }

    #[tokio::test]
    async fn test_replay_restores_daily_counters() {
        let now = Utc::now();
        let fill = |action, pnl| Fill {
            intent_id: Uuid::new_v4(),
            symbol: SYM.to_string(),
            action,
            price: dec!(100),
            amount: dec!(1),
            notional: dec!(100),
            realized_pnl: pnl,
            exit: None,
            paper: true,
            filled_at: now,
        };
        let ledger = PaperLedger::new(dec!(10000));
        // The sell closes a position from an earlier day
        let replayed = ledger
            .replay(&[fill(Action::Sell, dec!(-30)), fill(Action::Buy, Decimal::ZERO)])
            .await;
        assert_eq!(replayed, 2);

        let counter = ledger.daily_counter(SYM, now.date_naive()).await.unwrap();
        assert_eq!(counter.trades, 2);
        assert_eq!(counter.realized_loss(), dec!(30));
        assert!(ledger.open_position(SYM).await.unwrap().is_some());
    }
}
