//! Closed table of strategy evaluators
//!
//! A strategy is a name in the config source plus a pure function from an
//! indicator snapshot to a vote. Adding a strategy means adding a variant
//! here; nothing is discovered at runtime.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use super::indicators::IndicatorSnapshot;
use crate::domain::{Action, SignalVote, StrategyConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    SmaCrossover,
    Rsi,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 2] = [StrategyKind::SmaCrossover, StrategyKind::Rsi];

    pub fn name(&self) -> &'static str {
        match self {
            StrategyKind::SmaCrossover => "sma_crossover",
            StrategyKind::Rsi => "rsi",
        }
    }

    /// Produce this strategy's vote for a snapshot
    pub fn evaluate(&self, config: &StrategyConfig, snapshot: &IndicatorSnapshot) -> SignalVote {
        let (action, confidence, reason) = match self {
            StrategyKind::SmaCrossover => sma_crossover(config, snapshot),
            StrategyKind::Rsi => rsi(config, snapshot),
        };
        let mut vote = SignalVote::new(&config.strategy_name, &snapshot.symbol, action)
            .with_reason(reason);
        vote.confidence = confidence;
        vote.weight = config.weight;
        for (name, value) in [
            ("short_sma", snapshot.short_sma),
            ("long_sma", snapshot.long_sma),
            ("rsi", snapshot.rsi),
            ("rsi_momentum", snapshot.rsi_momentum),
        ] {
            if let Some(value) = value {
                vote.indicators.insert(name.to_string(), value);
            }
        }
        vote
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyKind {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "sma_crossover" | "moving_average" | "sma" => Ok(StrategyKind::SmaCrossover),
            "rsi" | "rsi_strategy" => Ok(StrategyKind::Rsi),
            other => Err(format!("unregistered strategy: {other}")),
        }
    }
}

type Evaluation = (Action, Option<f64>, String);

fn sma_crossover(config: &StrategyConfig, s: &IndicatorSnapshot) -> Evaluation {
    let (Some(short), Some(long), Some(prev_short), Some(prev_long)) =
        (s.short_sma, s.long_sma, s.prev_short_sma, s.prev_long_sma)
    else {
        return (
            Action::Hold,
            None,
            "insufficient SMA history for crossover detection".to_string(),
        );
    };
    if long <= 0.0 {
        return (Action::Hold, None, "long SMA is not positive".to_string());
    }

    let spread_pct = (short - long) / long * 100.0;
    let action = if prev_short <= prev_long && short > long {
        Action::Buy
    } else if prev_short >= prev_long && short < long {
        Action::Sell
    } else {
        return (
            Action::Hold,
            Some(0.0),
            format!("no crossover (spread {spread_pct:.2}%)"),
        );
    };

    let strong = config.param_f64("strong_spread_percent", 2.0);
    let mut confidence: f64 = 0.6;
    if spread_pct.abs() > strong {
        confidence += 0.2;
    } else if spread_pct.abs() > strong / 2.0 {
        confidence += 0.1;
    }
    let price = s.price_f64();
    let aligned = match action {
        Action::Buy => price > short && short > long,
        _ => price < short && short < long,
    };
    if aligned {
        confidence += 0.1;
    }
    if s.volume_surge() {
        confidence += 0.1;
    }

    let label = if action == Action::Buy {
        "golden cross"
    } else {
        "death cross"
    };
    (
        action,
        Some(confidence.min(1.0)),
        format!("{label} (spread {spread_pct:.2}%)"),
    )
}

fn rsi(config: &StrategyConfig, s: &IndicatorSnapshot) -> Evaluation {
    let Some(rsi) = s.rsi else {
        return (Action::Hold, None, "RSI unavailable".to_string());
    };
    let oversold = config.param_f64("oversold_threshold", 30.0);
    let overbought = config.param_f64("overbought_threshold", 70.0);
    let momentum = s.rsi_momentum.unwrap_or(0.0);

    if rsi <= oversold {
        if momentum <= 0.0 {
            return (
                Action::Hold,
                Some(0.0),
                format!("RSI oversold but momentum negative (RSI {rsi:.1})"),
            );
        }
        let mut confidence: f64 = 0.5;
        confidence += if rsi <= oversold - 10.0 {
            0.3
        } else if rsi <= oversold - 5.0 {
            0.2
        } else {
            0.1
        };
        if momentum > 2.0 {
            confidence += 0.1;
        }
        return (
            Action::Buy,
            Some(confidence.min(1.0)),
            format!("RSI oversold (RSI {rsi:.1}, momentum positive)"),
        );
    }

    if rsi >= overbought {
        if momentum >= 0.0 {
            return (
                Action::Hold,
                Some(0.0),
                format!("RSI overbought but momentum positive (RSI {rsi:.1})"),
            );
        }
        let mut confidence: f64 = 0.5;
        confidence += if rsi >= overbought + 10.0 {
            0.3
        } else if rsi >= overbought + 5.0 {
            0.2
        } else {
            0.1
        };
        if momentum < -2.0 {
            confidence += 0.1;
        }
        return (
            Action::Sell,
            Some(confidence.min(1.0)),
            format!("RSI overbought (RSI {rsi:.1}, momentum negative)"),
        );
    }

    (
        Action::Hold,
        Some(0.0),
        format!("RSI neutral ({rsi:.1})"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn cfg(name: &str) -> StrategyConfig {
        StrategyConfig::new(name, dec!(0.5))
    }

    #[test]
    fn test_golden_cross_buys() {
        let snap = IndicatorSnapshot::new("X/USD", dec!(105)).with_sma((99.0, 100.0), (101.0, 100.0));
        let vote = StrategyKind::SmaCrossover.evaluate(&cfg("sma_crossover"), &snap);
        assert_eq!(vote.action, Action::Buy);
        assert_eq!(vote.weight, dec!(0.5));
        // 1% spread adds nothing, price above both adds 0.1
        assert!((vote.confidence.unwrap() - 0.7).abs() < 1e-9);
    }

    #[test]
    fn test_death_cross_sells() {
        let snap = IndicatorSnapshot::new("X/USD", dec!(95)).with_sma((101.0, 100.0), (97.0, 100.0));
        let vote = StrategyKind::SmaCrossover.evaluate(&cfg("sma_crossover"), &snap);
        assert_eq!(vote.action, Action::Sell);
    }

    #[test]
    fn test_missing_sma_history_holds() {
        let snap = IndicatorSnapshot::new("X/USD", dec!(100));
        let vote = StrategyKind::SmaCrossover.evaluate(&cfg("sma_crossover"), &snap);
        assert_eq!(vote.action, Action::Hold);
        assert!(vote.reason.contains("insufficient"));
    }

    #[test]
    fn test_rsi_needs_momentum_confirmation() {
        let rising = IndicatorSnapshot::new("X/USD", dec!(100)).with_rsi(22.0, 3.0);
        let falling = IndicatorSnapshot::new("X/USD", dec!(100)).with_rsi(22.0, -1.0);
        assert_eq!(StrategyKind::Rsi.evaluate(&cfg("rsi"), &rising).action, Action::Buy);
        assert_eq!(StrategyKind::Rsi.evaluate(&cfg("rsi"), &falling).action, Action::Hold);

        let overbought = IndicatorSnapshot::new("X/USD", dec!(100)).with_rsi(78.0, -4.0);
        assert_eq!(StrategyKind::Rsi.evaluate(&cfg("rsi"), &overbought).action, Action::Sell);
    }

    #[test]
    fn test_rsi_thresholds_from_parameters() {
        let config = cfg("rsi").with_param("oversold_threshold", serde_json::json!(40.0));
        let snap = IndicatorSnapshot::new("X/USD", dec!(100)).with_rsi(35.0, 1.0);
        assert_eq!(StrategyKind::Rsi.evaluate(&config, &snap).action, Action::Buy);
    }

    #[test]
    fn test_names_round_trip_through_registry() {
        for kind in StrategyKind::ALL {
            assert_eq!(kind.name().parse::<StrategyKind>().unwrap(), kind);
        }
        assert!("macd".parse::<StrategyKind>().is_err());
    }
}
