use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Precomputed indicator values for one instrument at one point in time.
///
/// Indicator math happens upstream; evaluators only read these numbers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndicatorSnapshot {
    /// Filled from the map key when a snapshot file omits it
    #[serde(default)]
    pub symbol: String,
    pub price: Decimal,
    #[serde(default)]
    pub short_sma: Option<f64>,
    #[serde(default)]
    pub long_sma: Option<f64>,
    #[serde(default)]
    pub prev_short_sma: Option<f64>,
    #[serde(default)]
    pub prev_long_sma: Option<f64>,
    #[serde(default)]
    pub rsi: Option<f64>,
    /// Change in RSI over the last few bars
    #[serde(default)]
    pub rsi_momentum: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub prev_volume: Option<f64>,
    /// Recent return volatility, in percent
    #[serde(default)]
    pub volatility: Option<f64>,
}

impl IndicatorSnapshot {
    pub fn new(symbol: &str, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            price,
            ..Default::default()
        }
    }

    pub fn price_f64(&self) -> f64 {
        use rust_decimal::prelude::ToPrimitive;
        self.price.to_f64().unwrap_or(0.0)
    }

    pub fn with_sma(mut self, prev: (f64, f64), current: (f64, f64)) -> Self {
        self.prev_short_sma = Some(prev.0);
        self.prev_long_sma = Some(prev.1);
        self.short_sma = Some(current.0);
        self.long_sma = Some(current.1);
        self
    }

    pub fn with_rsi(mut self, rsi: f64, momentum: f64) -> Self {
        self.rsi = Some(rsi);
        self.rsi_momentum = Some(momentum);
        self
    }

    pub fn with_volatility(mut self, volatility: f64) -> Self {
        self.volatility = Some(volatility);
        self
    }

    /// Volume rose more than 20% bar over bar
    pub fn volume_surge(&self) -> bool {
        match (self.volume, self.prev_volume) {
            (Some(v), Some(p)) if p > 0.0 => v > p * 1.2,
            _ => false,
        }
    }
}
