use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;

/// Per-instrument trading configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentConfig {
    /// Trading pair symbol, e.g. "BTC/USDT"
    pub symbol: String,
    pub base_currency: String,
    pub quote_currency: String,
    pub active: bool,
    /// Capital notionally allocated to this instrument
    pub initial_balance: Decimal,
    /// Notional of one trade under fixed sizing
    pub trade_size_usd: Decimal,
    /// Cap on this instrument's share of total portfolio value, in percent
    pub max_position_percent: Decimal,
    pub min_trade_amount: Decimal,
    pub max_trade_amount: Decimal,
    pub price_precision: u32,
    pub amount_precision: u32,
}

impl InstrumentConfig {
    /// Build a config with the stock defaults for a symbol like "BTC/USDT"
    pub fn with_defaults(symbol: &str) -> Self {
        let (base, quote) = symbol.split_once('/').unwrap_or((symbol, "USD"));
        Self {
            symbol: symbol.to_string(),
            base_currency: base.to_string(),
            quote_currency: quote.to_string(),
            active: true,
            initial_balance: Decimal::from(1000),
            trade_size_usd: Decimal::from(100),
            max_position_percent: Decimal::from(20),
            min_trade_amount: Decimal::new(1, 3),
            max_trade_amount: Decimal::from(10_000),
            price_precision: 2,
            amount_precision: 6,
        }
    }
}

/// Strategy participation for one instrument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub strategy_name: String,
    pub enabled: bool,
    /// Relative influence in [0, 1]; normalised across enabled strategies at decision time
    pub weight: Decimal,
    /// Strategy-specific parameters, opaque to the aggregator
    #[serde(default)]
    pub parameters: HashMap<String, serde_json::Value>,
}

impl StrategyConfig {
    pub fn new(strategy_name: &str, weight: Decimal) -> Self {
        Self {
            strategy_name: strategy_name.to_string(),
            enabled: true,
            weight,
            parameters: HashMap::new(),
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn with_param(mut self, key: &str, value: serde_json::Value) -> Self {
        self.parameters.insert(key.to_string(), value);
        self
    }

    pub fn param_u64(&self, key: &str, default: u64) -> u64 {
        self.parameters
            .get(key)
            .and_then(|v| v.as_u64())
            .unwrap_or(default)
    }

    pub fn param_f64(&self, key: &str, default: f64) -> f64 {
        self.parameters
            .get(key)
            .and_then(|v| v.as_f64())
            .unwrap_or(default)
    }
}

/// How a proposed trade's notional is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionSizingMethod {
    /// `trade_size_usd` per trade
    Fixed,
    /// `sizing_percent` of the instrument's balance
    PercentOfBalance,
    /// Fixed size, scaled down when recent volatility is high
    VolatilityScaled,
}

impl std::fmt::Display for PositionSizingMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PositionSizingMethod::Fixed => write!(f, "fixed"),
            PositionSizingMethod::PercentOfBalance => write!(f, "percent_of_balance"),
            PositionSizingMethod::VolatilityScaled => write!(f, "volatility_scaled"),
        }
    }
}

impl FromStr for PositionSizingMethod {
    type Err = String;

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "fixed" | "fixed_amount" => Ok(PositionSizingMethod::Fixed),
            "percent_of_balance" | "percent" | "percentage" => {
                Ok(PositionSizingMethod::PercentOfBalance)
            }
            "volatility_scaled" | "volatility" | "volatility_based" => {
                Ok(PositionSizingMethod::VolatilityScaled)
            }
            other => Err(format!("unknown position sizing method: {other}")),
        }
    }
}

/// Per-instrument risk limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskConfig {
    pub stop_loss_percent: Decimal,
    pub take_profit_percent: Decimal,
    pub max_daily_trades: u32,
    /// Relative to the instrument's initial balance
    pub max_daily_loss_percent: Decimal,
    pub trailing_stop_enabled: bool,
    pub trailing_stop_percent: Decimal,
    /// Stored with the instrument; portfolio drawdown is gated globally
    pub max_drawdown_percent: Decimal,
    pub position_sizing_method: PositionSizingMethod,
    /// Used by `PercentOfBalance`
    pub sizing_percent: Decimal,
    pub volatility_lookback_days: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            stop_loss_percent: Decimal::from(5),
            take_profit_percent: Decimal::from(10),
            max_daily_trades: 10,
            max_daily_loss_percent: Decimal::from(5),
            trailing_stop_enabled: false,
            trailing_stop_percent: Decimal::from(3),
            max_drawdown_percent: Decimal::from(15),
            position_sizing_method: PositionSizingMethod::Fixed,
            sizing_percent: Decimal::from(10),
            volatility_lookback_days: 20,
        }
    }
}

/// Portfolio-wide risk settings folded from the system settings table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GlobalRiskConfig {
    /// Relative to `total_portfolio_balance`
    pub global_max_daily_loss_percent: Decimal,
    pub correlation_check_enabled: bool,
    pub emergency_stop_enabled: bool,
    /// Portfolio drawdown from peak, in percent, that trips the emergency stop
    pub emergency_stop_threshold_percent: Decimal,
    pub total_portfolio_balance: Decimal,
    pub max_concurrent_positions: u32,
}

impl From<&crate::config::RiskDefaults> for GlobalRiskConfig {
    fn from(defaults: &crate::config::RiskDefaults) -> Self {
        Self {
            global_max_daily_loss_percent: defaults.global_max_daily_loss_percent,
            correlation_check_enabled: defaults.correlation_check_enabled,
            emergency_stop_enabled: defaults.emergency_stop_enabled,
            emergency_stop_threshold_percent: defaults.emergency_stop_threshold_percent,
            total_portfolio_balance: defaults.total_portfolio_balance,
            max_concurrent_positions: defaults.max_concurrent_positions,
        }
    }
}

impl Default for GlobalRiskConfig {
    fn default() -> Self {
        Self::from(&crate::config::RiskDefaults::default())
    }
}

/// Typed value of one system setting row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SettingValue {
    String(String),
    Integer(i64),
    Float(Decimal),
    Boolean(bool),
    Json(serde_json::Value),
}

impl SettingValue {
    /// Decode a stored `(value, type)` pair
    pub fn parse(raw: &str, kind: &str) -> std::result::Result<Self, String> {
        match kind {
            "integer" => raw
                .trim()
                .parse::<i64>()
                .map(SettingValue::Integer)
                .map_err(|e| format!("bad integer {raw:?}: {e}")),
            "float" => Decimal::from_str(raw.trim())
                .map(SettingValue::Float)
                .map_err(|e| format!("bad float {raw:?}: {e}")),
            "boolean" => Ok(SettingValue::Boolean(matches!(
                raw.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ))),
            "json" => serde_json::from_str(raw)
                .map(SettingValue::Json)
                .map_err(|e| format!("bad json {raw:?}: {e}")),
            _ => Ok(SettingValue::String(raw.to_string())),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            SettingValue::String(_) => "string",
            SettingValue::Integer(_) => "integer",
            SettingValue::Float(_) => "float",
            SettingValue::Boolean(_) => "boolean",
            SettingValue::Json(_) => "json",
        }
    }

    pub fn to_raw(&self) -> String {
        match self {
            SettingValue::String(s) => s.clone(),
            SettingValue::Integer(i) => i.to_string(),
            SettingValue::Float(d) => d.to_string(),
            SettingValue::Boolean(b) => b.to_string(),
            SettingValue::Json(v) => v.to_string(),
        }
    }

    fn as_decimal(&self) -> Option<Decimal> {
        match self {
            SettingValue::Integer(i) => Some(Decimal::from(*i)),
            SettingValue::Float(d) => Some(*d),
            SettingValue::String(s) => Decimal::from_str(s.trim()).ok(),
            _ => None,
        }
    }

    fn as_bool(&self) -> Option<bool> {
        match self {
            SettingValue::Boolean(b) => Some(*b),
            SettingValue::Integer(i) => Some(*i != 0),
            _ => None,
        }
    }
}

impl GlobalRiskConfig {
    /// Overlay system settings on top of `self`. Unknown keys are ignored;
    /// values of the wrong shape are reported back and leave the field untouched.
    pub fn apply_settings<'a, I>(mut self, settings: I) -> (Self, Vec<String>)
    where
        I: IntoIterator<Item = (&'a str, &'a SettingValue)>,
    {
        let mut problems = Vec::new();
        for (key, value) in settings {
            let applied = match key {
                "global_max_daily_loss_percent" => value
                    .as_decimal()
                    .map(|v| self.global_max_daily_loss_percent = v),
                "emergency_stop_threshold_percent" | "max_drawdown_percent" => value
                    .as_decimal()
                    .map(|v| self.emergency_stop_threshold_percent = v),
                "total_portfolio_balance" => {
                    value.as_decimal().map(|v| self.total_portfolio_balance = v)
                }
                "correlation_check_enabled" => {
                    value.as_bool().map(|v| self.correlation_check_enabled = v)
                }
                "emergency_stop_enabled" => {
                    value.as_bool().map(|v| self.emergency_stop_enabled = v)
                }
                "max_concurrent_positions" => match value {
                    SettingValue::Integer(i) if *i >= 0 => {
                        self.max_concurrent_positions = *i as u32;
                        Some(())
                    }
                    _ => None,
                },
                _ => Some(()),
            };
            if applied.is_none() {
                problems.push(format!("setting {key} has unusable value {value:?}"));
            }
        }
        (self, problems)
    }
}
