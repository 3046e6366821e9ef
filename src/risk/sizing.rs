use rust_decimal::{Decimal, RoundingStrategy};
use serde::Serialize;

use crate::domain::{InstrumentConfig, PositionSizingMethod, RiskConfig};

/// Volatility (percent) above which volatility-scaled sizing shrinks orders
pub const HIGH_VOLATILITY_PERCENT: f64 = 5.0;

/// Multiplier applied to orders in high volatility
pub const HIGH_VOLATILITY_SCALE: Decimal = Decimal::from_parts(7, 0, 0, false, 1);

/// Proposed order size
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SizedOrder {
    pub notional: Decimal,
    pub amount: Decimal,
}

impl SizedOrder {
    pub const ZERO: SizedOrder = SizedOrder {
        notional: Decimal::ZERO,
        amount: Decimal::ZERO,
    };
}

/// Target notional before rounding and clamping
pub fn target_notional(
    instrument: &InstrumentConfig,
    risk: &RiskConfig,
    volatility: Option<f64>,
) -> Decimal {
    match risk.position_sizing_method {
        PositionSizingMethod::Fixed => instrument.trade_size_usd,
        PositionSizingMethod::PercentOfBalance => {
            instrument.initial_balance * risk.sizing_percent / Decimal::ONE_HUNDRED
        }
        PositionSizingMethod::VolatilityScaled => match volatility {
            Some(v) if v > HIGH_VOLATILITY_PERCENT => {
                instrument.trade_size_usd * HIGH_VOLATILITY_SCALE
            }
            _ => instrument.trade_size_usd,
        },
    }
}

/// Size an order at `price`: amount rounded down to the instrument's
/// precision and clamped to its min/max trade amount. Zero when the price
/// is not positive.
pub fn size_order(
    instrument: &InstrumentConfig,
    risk: &RiskConfig,
    price: Decimal,
    volatility: Option<f64>,
) -> SizedOrder {
    if price <= Decimal::ZERO {
        return SizedOrder::ZERO;
    }
    let notional = target_notional(instrument, risk, volatility);
    if notional <= Decimal::ZERO {
        return SizedOrder::ZERO;
    }

    let amount = (notional / price)
        .round_dp_with_strategy(instrument.amount_precision, RoundingStrategy::ToZero)
        .max(instrument.min_trade_amount)
        .min(instrument.max_trade_amount);

    SizedOrder {
        notional: (amount * price).round_dp(instrument.price_precision.max(2)),
        amount,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn instrument() -> InstrumentConfig {
        InstrumentConfig::with_defaults("X/USD")
    }

    #[test]
    fn test_fixed_sizing() {
        let order = size_order(&instrument(), &RiskConfig::default(), dec!(50), None);
        assert_eq!(order.amount, dec!(2));
        assert_eq!(order.notional, dec!(100));
    }

    #[test]
    fn test_percent_of_balance() {
        let risk = RiskConfig {
            position_sizing_method: PositionSizingMethod::PercentOfBalance,
            sizing_percent: dec!(25),
            ..RiskConfig::default()
        };
        let order = size_order(&instrument(), &risk, dec!(100), None);
        // 25% of 1000
        assert_eq!(order.amount, dec!(2.5));
    }

    #[test]
    fn test_volatility_scaled() {
        let risk = RiskConfig {
            position_sizing_method: PositionSizingMethod::VolatilityScaled,
            ..RiskConfig::default()
        };
        assert_eq!(target_notional(&instrument(), &risk, Some(8.0)), dec!(70));
        assert_eq!(target_notional(&instrument(), &risk, Some(2.0)), dec!(100));
        assert_eq!(target_notional(&instrument(), &risk, None), dec!(100));
    }

    #[test]
    fn test_amount_rounded_down_and_clamped() {
        let mut inst = instrument();
        inst.amount_precision = 2;
        let order = size_order(&inst, &RiskConfig::default(), dec!(30), None);
        // 100 / 30 = 3.333.. -> 3.33
        assert_eq!(order.amount, dec!(3.33));

        inst.max_trade_amount = dec!(1);
        let order = size_order(&inst, &RiskConfig::default(), dec!(30), None);
        assert_eq!(order.amount, dec!(1));
    }

    #[test]
    fn test_non_positive_price_sizes_to_zero() {
        assert_eq!(
            size_order(&instrument(), &RiskConfig::default(), Decimal::ZERO, None),
            SizedOrder::ZERO
        );
    }
}
