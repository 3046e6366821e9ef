//! Durable configuration store boundary
//!
//! The cache never originates configuration; it mirrors whatever a
//! `ConfigSource` returns and drops keys when the source reports a mutation.

pub mod memory;
pub mod postgres;

pub use memory::InMemoryConfigSource;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::cache::keys;
use crate::domain::{
    GlobalRiskConfig, InstrumentConfig, PositionSizingMethod, RiskConfig, SettingValue,
    StrategyConfig,
};
use crate::error::{QuorumError, Result};

/// Capacity of mutation broadcast channels
pub const MUTATION_CHANNEL_CAPACITY: usize = 256;

/// A change in the config source that makes cached copies stale
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ConfigMutation {
    Instrument { symbol: String },
    Strategy { symbol: String, strategy: String },
    Risk { symbol: String },
    Global,
    ActiveSet,
    /// Drop one instrument's working set, or every key when `symbol` is absent.
    /// Sent when mutations may have been missed.
    Flush {
        #[serde(default)]
        symbol: Option<String>,
    },
}

impl ConfigMutation {
    /// Cache keys that must be dropped before the next read.
    /// `Flush` is resolved by pattern in `ConfigService::invalidate` instead.
    pub fn affected_keys(&self) -> Vec<String> {
        match self {
            ConfigMutation::Instrument { symbol } => vec![
                keys::instrument(symbol),
                keys::ACTIVE_INSTRUMENTS.to_string(),
            ],
            ConfigMutation::Strategy { symbol, .. } => vec![keys::strategies(symbol)],
            ConfigMutation::Risk { symbol } => vec![keys::risk(symbol)],
            ConfigMutation::Global => vec![keys::GLOBAL_RISK.to_string()],
            ConfigMutation::ActiveSet => vec![keys::ACTIVE_INSTRUMENTS.to_string()],
            ConfigMutation::Flush { .. } => Vec::new(),
        }
    }
}

/// Partial update of one instrument/strategy link
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyUpdate {
    pub enabled: Option<bool>,
    pub weight: Option<Decimal>,
    pub parameters: Option<std::collections::HashMap<String, serde_json::Value>>,
}

impl StrategyUpdate {
    /// Weights live in [0, 1]
    pub fn validate(&self) -> Result<()> {
        match self.weight {
            Some(w) if w < Decimal::ZERO || w > Decimal::ONE => Err(QuorumError::Validation(
                format!("strategy weight {w} outside [0, 1]"),
            )),
            _ => Ok(()),
        }
    }

    /// Apply onto an existing link, or a fresh one when absent
    pub fn apply(&self, name: &str, existing: Option<StrategyConfig>) -> StrategyConfig {
        let mut cfg = existing.unwrap_or_else(|| StrategyConfig::new(name, Decimal::ONE));
        if let Some(enabled) = self.enabled {
            cfg.enabled = enabled;
        }
        if let Some(weight) = self.weight {
            cfg.weight = weight;
        }
        if let Some(parameters) = &self.parameters {
            cfg.parameters.extend(parameters.clone());
        }
        cfg
    }
}

/// Partial update of one instrument's risk config
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RiskUpdate {
    pub stop_loss_percent: Option<Decimal>,
    pub take_profit_percent: Option<Decimal>,
    pub max_daily_trades: Option<u32>,
    pub max_daily_loss_percent: Option<Decimal>,
    pub trailing_stop_enabled: Option<bool>,
    pub trailing_stop_percent: Option<Decimal>,
    pub max_drawdown_percent: Option<Decimal>,
    pub position_sizing_method: Option<PositionSizingMethod>,
    pub sizing_percent: Option<Decimal>,
}

impl RiskUpdate {
    pub fn apply(&self, existing: Option<RiskConfig>) -> RiskConfig {
        let mut cfg = existing.unwrap_or_default();
        if let Some(v) = self.stop_loss_percent {
            cfg.stop_loss_percent = v;
        }
        if let Some(v) = self.take_profit_percent {
            cfg.take_profit_percent = v;
        }
        if let Some(v) = self.max_daily_trades {
            cfg.max_daily_trades = v;
        }
        if let Some(v) = self.max_daily_loss_percent {
            cfg.max_daily_loss_percent = v;
        }
        if let Some(v) = self.trailing_stop_enabled {
            cfg.trailing_stop_enabled = v;
        }
        if let Some(v) = self.trailing_stop_percent {
            cfg.trailing_stop_percent = v;
        }
        if let Some(v) = self.max_drawdown_percent {
            cfg.max_drawdown_percent = v;
        }
        if let Some(v) = self.position_sizing_method {
            cfg.position_sizing_method = v;
        }
        if let Some(v) = self.sizing_percent {
            cfg.sizing_percent = v;
        }
        cfg
    }
}

/// Durable store of instrument, strategy, risk and system configuration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Symbols of instruments flagged active
    async fn active_instruments(&self) -> Result<Vec<String>>;

    /// Point lookup; `None` when the symbol is unknown
    async fn instrument(&self, symbol: &str) -> Result<Option<InstrumentConfig>>;

    /// Every strategy link for an instrument, enabled or not
    async fn strategies(&self, symbol: &str) -> Result<Vec<StrategyConfig>>;

    async fn risk_config(&self, symbol: &str) -> Result<Option<RiskConfig>>;

    /// Global settings overlaid on `defaults`
    async fn global_risk_config(&self, defaults: &GlobalRiskConfig) -> Result<GlobalRiskConfig>;

    async fn set_instrument_active(&self, symbol: &str, active: bool) -> Result<()>;

    async fn update_strategy(&self, symbol: &str, strategy: &str, update: &StrategyUpdate)
        -> Result<()>;

    async fn update_risk(&self, symbol: &str, update: &RiskUpdate) -> Result<()>;

    async fn set_system_setting(&self, key: &str, value: &SettingValue) -> Result<()>;

    /// Mutation feed, when the source can push one
    fn subscribe(&self) -> Option<broadcast::Receiver<ConfigMutation>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_affected_keys() {
        let m = ConfigMutation::Strategy {
            symbol: "X/USD".into(),
            strategy: "rsi".into(),
        };
        assert_eq!(m.affected_keys(), vec!["strategies:X/USD".to_string()]);
        let m = ConfigMutation::Instrument {
            symbol: "X/USD".into(),
        };
        assert!(m.affected_keys().contains(&"instrument:X/USD".to_string()));
    }

    #[test]
    fn test_strategy_weight_range() {
        for (weight, ok) in [(dec!(0), true), (dec!(1), true), (dec!(-0.01), false), (dec!(1.01), false)] {
            let update = StrategyUpdate {
                weight: Some(weight),
                ..Default::default()
            };
            assert_eq!(update.validate().is_ok(), ok, "{weight}");
        }
        assert!(StrategyUpdate::default().validate().is_ok());
    }

    #[test]
    fn test_flush_payloads() {
        let m: ConfigMutation = serde_json::from_str(r#"{"kind":"flush"}"#).unwrap();
        assert_eq!(m, ConfigMutation::Flush { symbol: None });
        let m: ConfigMutation =
            serde_json::from_str(r#"{"kind":"flush","symbol":"BTC/USDT"}"#).unwrap();
        assert_eq!(
            m,
            ConfigMutation::Flush {
                symbol: Some("BTC/USDT".to_string())
            }
        );
    }

    #[test]
    fn test_mutation_wire_format() {
        let raw = r#"{"kind":"risk","symbol":"BTC/USDT"}"#;
        let m: ConfigMutation = serde_json::from_str(raw).unwrap();
        assert_eq!(
            m,
            ConfigMutation::Risk {
                symbol: "BTC/USDT".into()
            }
        );
    }

    #[test]
    fn test_updates_apply_partially() {
        let cfg = StrategyUpdate {
            weight: Some(dec!(0.25)),
            ..Default::default()
        }
        .apply("rsi", None);
        assert!(cfg.enabled);
        assert_eq!(cfg.weight, dec!(0.25));

        let risk = RiskUpdate {
            max_daily_trades: Some(5),
            ..Default::default()
        }
        .apply(Some(RiskConfig::default()));
        assert_eq!(risk.max_daily_trades, 5);
        assert_eq!(risk.stop_loss_percent, RiskConfig::default().stop_loss_percent);
    }
}
