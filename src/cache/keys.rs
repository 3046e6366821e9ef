//! Cache key layout
//!
//! Every per-instrument key ends with `:{symbol}` so `*:{symbol}` drops an
//! instrument's whole working set at once.

pub const ACTIVE_INSTRUMENTS: &str = "active_instruments";
pub const GLOBAL_RISK: &str = "global_risk";

pub const INSTRUMENT_PREFIX: &str = "instrument:";
pub const STRATEGIES_PREFIX: &str = "strategies:";
pub const RISK_PREFIX: &str = "risk:";

pub fn instrument(symbol: &str) -> String {
    format!("{INSTRUMENT_PREFIX}{symbol}")
}

pub fn strategies(symbol: &str) -> String {
    format!("{STRATEGIES_PREFIX}{symbol}")
}

pub fn risk(symbol: &str) -> String {
    format!("{RISK_PREFIX}{symbol}")
}

/// Glob matching every key that belongs to one instrument
pub fn all_for(symbol: &str) -> String {
    format!("*:{symbol}")
}
