//! Weighted vote aggregation
//!
//! Each counted vote contributes `normalized_weight * score` where BUY = +1,
//! SELL = -1, HOLD = 0 and weights are normalised over the counted votes.
//! The sum S decides: BUY if S > epsilon, SELL if S < -epsilon, HOLD otherwise.

use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use super::indicators::IndicatorSnapshot;
use super::registry::StrategyKind;
use crate::cache::ConfigService;
use crate::domain::{
    Action, AggregateDecision, CountedVote, HoldReason, SignalVote, StrategyConfig, VoteStatus,
};
use crate::error::Result;

/// Evaluate every enabled, registered strategy against a snapshot
pub fn collect_votes(strategies: &[StrategyConfig], snapshot: &IndicatorSnapshot) -> Vec<SignalVote> {
    strategies
        .iter()
        .filter(|s| s.enabled)
        .filter_map(|config| match StrategyKind::from_str(&config.strategy_name) {
            Ok(kind) => Some(kind.evaluate(config, snapshot)),
            Err(e) => {
                warn!(symbol = %snapshot.symbol, "Skipping strategy: {}", e);
                None
            }
        })
        .collect()
}

/// Pure aggregation over an explicit strategy list
pub fn aggregate_votes(
    symbol: &str,
    strategies: &[StrategyConfig],
    votes: &[SignalVote],
    epsilon: Decimal,
) -> AggregateDecision {
    let mut configs: HashMap<&str, &StrategyConfig> = HashMap::new();
    for config in strategies {
        configs.entry(config.strategy_name.as_str()).or_insert(config);
    }

    let mut seen: HashSet<&str> = HashSet::new();
    let mut counted: Vec<CountedVote> = votes
        .iter()
        .map(|vote| {
            let status = if vote.symbol != symbol {
                VoteStatus::SymbolMismatch
            } else {
                match configs.get(vote.strategy.as_str()) {
                    None => VoteStatus::StrategyUnknown,
                    Some(config) if !config.enabled => VoteStatus::StrategyDisabled,
                    Some(_) if !seen.insert(vote.strategy.as_str()) => VoteStatus::Duplicate,
                    Some(_) => VoteStatus::Counted,
                }
            };
            CountedVote {
                vote: vote.clone(),
                status,
                normalized_weight: Decimal::ZERO,
                contribution: Decimal::ZERO,
            }
        })
        .collect();

    let weight_of = |cv: &CountedVote| {
        configs
            .get(cv.vote.strategy.as_str())
            .map(|c| c.weight.max(Decimal::ZERO))
            .unwrap_or(Decimal::ZERO)
    };
    let total: Decimal = counted
        .iter()
        .filter(|cv| cv.status == VoteStatus::Counted)
        .map(weight_of)
        .sum();

    if total <= Decimal::ZERO {
        return AggregateDecision {
            symbol: symbol.to_string(),
            action: Action::Hold,
            score: Decimal::ZERO,
            epsilon,
            votes: counted,
            hold_reason: Some(HoldReason::NoVotes),
            decided_at: Utc::now(),
        };
    }

    let mut score = Decimal::ZERO;
    for cv in counted.iter_mut().filter(|cv| cv.status == VoteStatus::Counted) {
        let normalized = weight_of(&*cv) / total;
        cv.normalized_weight = normalized;
        cv.contribution = normalized * cv.vote.action.score();
        score += cv.contribution;
    }
    let score = score.normalize();

    let (action, hold_reason) = if score > epsilon {
        (Action::Buy, None)
    } else if score < -epsilon {
        (Action::Sell, None)
    } else {
        (Action::Hold, Some(HoldReason::WithinEpsilon))
    };

    AggregateDecision {
        symbol: symbol.to_string(),
        action,
        score,
        epsilon,
        votes: counted,
        hold_reason,
        decided_at: Utc::now(),
    }
}

/// Aggregates votes against the strategy config current at call time
pub struct SignalAggregator {
    config: Arc<ConfigService>,
    epsilon: Decimal,
}

impl SignalAggregator {
    pub fn new(config: Arc<ConfigService>, epsilon: Decimal) -> Self {
        Self { config, epsilon }
    }

    pub fn epsilon(&self) -> Decimal {
        self.epsilon
    }

    /// Enabled flags and weights are read through the cache here, never
    /// taken from the votes themselves.
    pub async fn aggregate(&self, symbol: &str, votes: &[SignalVote]) -> Result<AggregateDecision> {
        let strategies = self.config.strategies(symbol).await?;
        let decision = aggregate_votes(symbol, &strategies, votes, self.epsilon);
        debug!(
            symbol,
            action = %decision.action,
            score = %decision.score,
            counted = decision.counted_votes().count(),
            "aggregated votes"
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    const SYM: &str = "X/USD";

    fn vote(strategy: &str, action: Action) -> SignalVote {
        SignalVote::new(strategy, SYM, action)
    }

    #[test]
    fn test_lone_buy_vote_buys() {
        let strategies = vec![StrategyConfig::new("a", dec!(1.0))];
        let d = aggregate_votes(SYM, &strategies, &[vote("a", Action::Buy)], Decimal::ZERO);
        assert_eq!(d.action, Action::Buy);
        assert_eq!(d.score, dec!(1));
        assert_eq!(d.hold_reason, None);
    }

    #[test]
    fn test_equal_opposite_votes_cancel() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.5)),
            StrategyConfig::new("b", dec!(0.5)),
        ];
        let votes = [vote("a", Action::Buy), vote("b", Action::Sell)];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.score, Decimal::ZERO);
        assert_eq!(d.hold_reason, Some(HoldReason::WithinEpsilon));
    }

    #[test]
    fn test_weighted_buy_and_hold() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.6)),
            StrategyConfig::new("b", dec!(0.4)),
        ];
        let votes = [vote("a", Action::Buy), vote("b", Action::Hold)];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.action, Action::Buy);
        assert_eq!(d.score, dec!(0.6));
        assert_eq!(d.counted_votes().count(), 2);
    }

    #[test]
    fn test_weights_need_not_sum_to_one() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.3)),
            StrategyConfig::new("b", dec!(0.1)),
        ];
        let votes = [vote("a", Action::Sell), vote("b", Action::Buy)];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.action, Action::Sell);
        assert_eq!(d.score, dec!(-0.5));
    }

    #[test]
    fn test_disabled_and_unknown_votes_are_ignored() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.5)),
            StrategyConfig::new("b", dec!(0.5)).disabled(),
        ];
        let votes = [
            vote("a", Action::Sell),
            vote("b", Action::Buy),
            vote("ghost", Action::Buy),
        ];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.action, Action::Sell);
        assert_eq!(d.votes[1].status, VoteStatus::StrategyDisabled);
        assert_eq!(d.votes[2].status, VoteStatus::StrategyUnknown);
        assert_eq!(d.votes[1].contribution, Decimal::ZERO);
    }

    #[test]
    fn test_no_enabled_votes_is_no_votes_hold() {
        let strategies = vec![StrategyConfig::new("a", dec!(1)).disabled()];
        let d = aggregate_votes(SYM, &strategies, &[vote("a", Action::Buy)], Decimal::ZERO);
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.hold_reason, Some(HoldReason::NoVotes));

        let d = aggregate_votes(SYM, &strategies, &[], Decimal::ZERO);
        assert_eq!(d.hold_reason, Some(HoldReason::NoVotes));
    }

    #[test]
    fn test_all_zero_weights_is_no_votes_hold() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0)),
            StrategyConfig::new("b", dec!(0)),
        ];
        let votes = [vote("a", Action::Buy), vote("b", Action::Buy)];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.hold_reason, Some(HoldReason::NoVotes));
    }

    #[test]
    fn test_epsilon_dead_band() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.55)),
            StrategyConfig::new("b", dec!(0.45)),
        ];
        let votes = [vote("a", Action::Buy), vote("b", Action::Sell)];
        // S = 0.1
        let d = aggregate_votes(SYM, &strategies, &votes, dec!(0.1));
        assert_eq!(d.action, Action::Hold);
        let d = aggregate_votes(SYM, &strategies, &votes, dec!(0.05));
        assert_eq!(d.action, Action::Buy);
    }

    #[test]
    fn test_duplicate_votes_count_once() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.5)),
            StrategyConfig::new("b", dec!(0.5)),
        ];
        let votes = [
            vote("a", Action::Buy),
            vote("a", Action::Buy),
            vote("b", Action::Sell),
        ];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.action, Action::Hold);
        assert_eq!(d.votes[1].status, VoteStatus::Duplicate);
    }

    #[test]
    fn test_other_symbol_votes_do_not_count() {
        let strategies = vec![StrategyConfig::new("a", dec!(1))];
        let votes = [SignalVote::new("a", "Y/USD", Action::Buy)];
        let d = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert_eq!(d.votes[0].status, VoteStatus::SymbolMismatch);
        assert_eq!(d.hold_reason, Some(HoldReason::NoVotes));
    }

    #[test]
    fn test_aggregation_is_idempotent() {
        let strategies = vec![
            StrategyConfig::new("a", dec!(0.2)),
            StrategyConfig::new("b", dec!(0.7)),
            StrategyConfig::new("c", dec!(0.1)),
        ];
        let votes = [
            vote("a", Action::Buy),
            vote("b", Action::Hold),
            vote("c", Action::Sell),
        ];
        let first = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        let second = aggregate_votes(SYM, &strategies, &votes, Decimal::ZERO);
        assert!(first.same_outcome(&second));
    }

    #[test]
    fn test_collect_votes_skips_disabled_and_unregistered() {
        let strategies = vec![
            StrategyConfig::new("sma_crossover", dec!(0.5)),
            StrategyConfig::new("rsi", dec!(0.5)).disabled(),
            StrategyConfig::new("macd", dec!(0.5)),
        ];
        let snap = IndicatorSnapshot::new(SYM, dec!(100));
        let votes = collect_votes(&strategies, &snap);
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].strategy, "sma_crossover");
    }
}
