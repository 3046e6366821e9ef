use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Action;

/// RiskGate's final disposition of a proposed trade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Approved,
    Rejected,
    DowngradedToHold,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::Approved => write!(f, "APPROVED"),
            Verdict::Rejected => write!(f, "REJECTED"),
            Verdict::DowngradedToHold => write!(f, "DOWNGRADED_TO_HOLD"),
        }
    }
}

/// Machine-readable reason attached to every rejection or downgrade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskReason {
    EmergencyStop,
    GlobalLossLimit,
    DailyTradeLimit,
    DailyLossLimit,
    PositionSizeExceeded,
}

impl RiskReason {
    pub fn code(&self) -> &'static str {
        match self {
            RiskReason::EmergencyStop => "EMERGENCY_STOP",
            RiskReason::GlobalLossLimit => "GLOBAL_LOSS_LIMIT",
            RiskReason::DailyTradeLimit => "DAILY_TRADE_LIMIT",
            RiskReason::DailyLossLimit => "DAILY_LOSS_LIMIT",
            RiskReason::PositionSizeExceeded => "POSITION_SIZE_EXCEEDED",
        }
    }
}

impl std::fmt::Display for RiskReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.code())
    }
}

/// Protective exit that forced a SELL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitTrigger {
    StopLoss,
    TakeProfit,
    TrailingStop,
}

impl std::fmt::Display for ExitTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitTrigger::StopLoss => write!(f, "STOP_LOSS"),
            ExitTrigger::TakeProfit => write!(f, "TAKE_PROFIT"),
            ExitTrigger::TrailingStop => write!(f, "TRAILING_STOP"),
        }
    }
}

/// Risk-checked trade proposal handed to the executor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: Uuid,
    pub symbol: String,
    /// Action after gating; HOLD when downgraded
    pub action: Action,
    /// Action the aggregator proposed
    pub proposed_action: Action,
    pub price: Decimal,
    pub amount: Decimal,
    pub notional: Decimal,
    pub verdict: Verdict,
    pub reason: Option<RiskReason>,
    pub exit: Option<ExitTrigger>,
    pub decision_score: Decimal,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

impl TradeIntent {
    pub(crate) fn new(symbol: &str, proposed: Action, price: Decimal, score: Decimal) -> Self {
        Self {
            id: Uuid::new_v4(),
            symbol: symbol.to_string(),
            action: proposed,
            proposed_action: proposed,
            price,
            amount: Decimal::ZERO,
            notional: Decimal::ZERO,
            verdict: Verdict::Approved,
            reason: None,
            exit: None,
            decision_score: score,
            note: String::new(),
            created_at: Utc::now(),
        }
    }

    /// Only approved BUY/SELL intents reach the executor
    pub fn is_actionable(&self) -> bool {
        self.verdict == Verdict::Approved && self.action.is_actionable()
    }

    pub(crate) fn approve(mut self, amount: Decimal, notional: Decimal) -> Self {
        self.verdict = Verdict::Approved;
        self.amount = amount;
        self.notional = notional;
        self
    }

    pub(crate) fn reject(mut self, reason: RiskReason, note: String) -> Self {
        self.verdict = Verdict::Rejected;
        self.reason = Some(reason);
        self.amount = Decimal::ZERO;
        self.notional = Decimal::ZERO;
        self.note = note;
        self
    }

    pub(crate) fn downgrade(mut self, reason: RiskReason, note: String) -> Self {
        self.verdict = Verdict::DowngradedToHold;
        self.action = Action::Hold;
        self.reason = Some(reason);
        self.amount = Decimal::ZERO;
        self.notional = Decimal::ZERO;
        self.note = note;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_reason_codes_serialize() {
        assert_eq!(
            serde_json::to_string(&RiskReason::DailyTradeLimit).unwrap(),
            "\"DAILY_TRADE_LIMIT\""
        );
        assert_eq!(RiskReason::PositionSizeExceeded.to_string(), "POSITION_SIZE_EXCEEDED");
    }

    #[test]
    fn test_downgrade_is_not_actionable() {
        let intent = TradeIntent::new("X/USD", Action::Buy, dec!(100), dec!(1))
            .downgrade(RiskReason::PositionSizeExceeded, String::new());
        assert_eq!(intent.action, Action::Hold);
        assert_eq!(intent.proposed_action, Action::Buy);
        assert!(!intent.is_actionable());
    }
}
