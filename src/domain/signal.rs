use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

/// Trading action proposed by a strategy or the aggregate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Action {
    Buy,
    Sell,
    Hold,
}

impl Action {
    /// Signed unit score used by weighted aggregation
    pub fn score(&self) -> Decimal {
        match self {
            Action::Buy => Decimal::ONE,
            Action::Sell => Decimal::NEGATIVE_ONE,
            Action::Hold => Decimal::ZERO,
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, Action::Hold)
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::Hold => write!(f, "HOLD"),
        }
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "BUY" => Ok(Action::Buy),
            "SELL" => Ok(Action::Sell),
            "HOLD" => Ok(Action::Hold),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// One strategy's opinion on one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalVote {
    pub strategy: String,
    pub symbol: String,
    pub action: Action,
    /// Strategy's own confidence in [0, 1], when it reports one
    pub confidence: Option<f64>,
    /// Indicator values the strategy looked at
    #[serde(default)]
    pub indicators: BTreeMap<String, f64>,
    #[serde(default)]
    pub reason: String,
    /// Weight resolved from the strategy config when the vote was produced.
    /// Informational only; aggregation re-reads the current config.
    pub weight: Decimal,
}

impl SignalVote {
    pub fn new(strategy: &str, symbol: &str, action: Action) -> Self {
        Self {
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            action,
            confidence: None,
            indicators: BTreeMap::new(),
            reason: String::new(),
            weight: Decimal::ZERO,
        }
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = reason.into();
        self
    }

    pub fn with_indicator(mut self, name: &str, value: f64) -> Self {
        self.indicators.insert(name.to_string(), value);
        self
    }
}

/// Why a vote did or did not count
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteStatus {
    Counted,
    StrategyDisabled,
    StrategyUnknown,
    Duplicate,
    SymbolMismatch,
}

/// A vote as seen by the aggregator, with the weight it actually carried
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountedVote {
    pub vote: SignalVote,
    pub status: VoteStatus,
    /// Normalised weight; zero unless `status` is `Counted`
    pub normalized_weight: Decimal,
    /// normalized_weight * action score
    pub contribution: Decimal,
}

/// Reason an aggregate resolved to HOLD
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    /// No enabled strategy produced a vote, or enabled weights sum to zero
    NoVotes,
    /// Weighted score fell inside [-epsilon, epsilon]
    WithinEpsilon,
}

impl std::fmt::Display for HoldReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HoldReason::NoVotes => write!(f, "no-votes"),
            HoldReason::WithinEpsilon => write!(f, "within-epsilon"),
        }
    }
}

/// Combined decision for one instrument in one cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateDecision {
    pub symbol: String,
    pub action: Action,
    /// Weighted sum S in [-1, 1]
    pub score: Decimal,
    pub epsilon: Decimal,
    /// Every vote considered, counted or not
    pub votes: Vec<CountedVote>,
    pub hold_reason: Option<HoldReason>,
    pub decided_at: DateTime<Utc>,
}

impl AggregateDecision {
    pub fn counted_votes(&self) -> impl Iterator<Item = &CountedVote> {
        self.votes
            .iter()
            .filter(|v| v.status == VoteStatus::Counted)
    }

    /// Same decision with a different timestamp; used when comparing runs
    pub fn same_outcome(&self, other: &AggregateDecision) -> bool {
        self.symbol == other.symbol
            && self.action == other.action
            && self.score == other.score
            && self.epsilon == other.epsilon
            && self.votes == other.votes
            && self.hold_reason == other.hold_reason
    }
}
