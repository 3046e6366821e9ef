//! Layered risk checks between the aggregate decision and the executor
//!
//! `RiskGate::evaluate` is pure: all portfolio state arrives in a
//! `RiskContext` snapshot taken by the caller. Checks run in a fixed order
//! and the first failure decides the verdict:
//!
//! 0. protective exits (stop-loss, take-profit, trailing stop) turn a
//!    HOLD/SELL on an open position into an exit SELL
//! 1. emergency stop
//! 2. global daily loss
//! 3. per-instrument daily trade count
//! 4. per-instrument daily loss
//! 5. position size (downgrades BUY to HOLD, never blocks SELL)

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use super::sizing::size_order;
use crate::domain::{
    Action, AggregateDecision, DailyTradeCounter, ExitTrigger, GlobalRiskConfig,
    InstrumentConfig, OpenPosition, PortfolioSnapshot, RiskConfig, RiskReason, TradeIntent,
};

/// Everything a risk check reads, captured once per evaluation
#[derive(Debug, Clone, Serialize)]
pub struct RiskContext {
    pub instrument: InstrumentConfig,
    pub risk: RiskConfig,
    pub global: GlobalRiskConfig,
    pub portfolio: PortfolioSnapshot,
    /// This instrument's trades and realised P&L today
    pub today: DailyTradeCounter,
    pub position: Option<OpenPosition>,
    pub price: Decimal,
    pub volatility: Option<f64>,
    /// Emergency latch state at snapshot time
    pub emergency_latched: bool,
}

impl RiskContext {
    fn percent_of(base: Decimal, pct: Decimal) -> Decimal {
        base * pct / Decimal::ONE_HUNDRED
    }

    /// Portfolio value used for allocation limits
    fn portfolio_value(&self) -> Decimal {
        if self.portfolio.total_value > Decimal::ZERO {
            self.portfolio.total_value
        } else {
            self.global.total_portfolio_balance
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RiskGate;

impl RiskGate {
    pub fn new() -> Self {
        Self
    }

    /// Gate one decision. Never fails: rejections and downgrades are verdicts.
    pub fn evaluate(&self, decision: &AggregateDecision, ctx: &RiskContext) -> TradeIntent {
        let symbol = decision.symbol.as_str();
        let intent = TradeIntent::new(symbol, decision.action, ctx.price, decision.score);

        if let Some((position, trigger)) = self.exit_trigger(decision.action, ctx) {
            return self.gate_exit(intent, position, trigger, ctx);
        }

        if decision.action == Action::Hold {
            debug!(symbol, "HOLD passes through");
            return intent;
        }

        if let Some(note) = self.emergency_blocks(ctx) {
            warn!(symbol, action = %decision.action, "Rejected: EMERGENCY_STOP ({})", note);
            return intent.reject(RiskReason::EmergencyStop, note);
        }

        let global_limit = RiskContext::percent_of(
            ctx.global.total_portfolio_balance,
            ctx.global.global_max_daily_loss_percent,
        );
        let global_loss = ctx.portfolio.global_today.realized_loss();
        if global_limit > Decimal::ZERO && global_loss >= global_limit {
            let note = format!("global loss today {global_loss} >= limit {global_limit}");
            info!(symbol, "Rejected: GLOBAL_LOSS_LIMIT ({})", note);
            return intent.reject(RiskReason::GlobalLossLimit, note);
        }

        if ctx.today.trades >= ctx.risk.max_daily_trades {
            let note = format!(
                "{} trades today >= max {}",
                ctx.today.trades, ctx.risk.max_daily_trades
            );
            info!(symbol, "Rejected: DAILY_TRADE_LIMIT ({})", note);
            return intent.reject(RiskReason::DailyTradeLimit, note);
        }

        let loss_limit = RiskContext::percent_of(
            ctx.instrument.initial_balance,
            ctx.risk.max_daily_loss_percent,
        );
        let loss = ctx.today.realized_loss();
        if loss_limit > Decimal::ZERO && loss >= loss_limit {
            let note = format!("loss today {loss} >= limit {loss_limit}");
            info!(symbol, "Rejected: DAILY_LOSS_LIMIT ({})", note);
            return intent.reject(RiskReason::DailyLossLimit, note);
        }

        let sized = size_order(&ctx.instrument, &ctx.risk, ctx.price, ctx.volatility);

        match decision.action {
            Action::Buy => {
                if sized.amount <= Decimal::ZERO {
                    let note = format!("cannot size order at price {}", ctx.price);
                    info!(symbol, "Downgraded: POSITION_SIZE_EXCEEDED ({})", note);
                    return intent.downgrade(RiskReason::PositionSizeExceeded, note);
                }
                let limit =
                    RiskContext::percent_of(ctx.portfolio_value(), ctx.instrument.max_position_percent);
                let projected = ctx.portfolio.instrument_value(symbol) + sized.notional;
                if projected > limit {
                    let note = format!("projected allocation {projected} > limit {limit}");
                    info!(symbol, "Downgraded: POSITION_SIZE_EXCEEDED ({})", note);
                    return intent.downgrade(RiskReason::PositionSizeExceeded, note);
                }
                intent.approve(sized.amount, sized.notional)
            }
            _ => {
                // Reduces exposure: sell what is held, else the sized amount
                let amount = ctx
                    .position
                    .as_ref()
                    .filter(|p| p.amount > Decimal::ZERO)
                    .map(|p| p.amount)
                    .unwrap_or(sized.amount);
                intent.approve(amount, amount * ctx.price)
            }
        }
    }

    /// Latched stop, or drawdown past the threshold when the stop is enabled
    fn emergency_blocks(&self, ctx: &RiskContext) -> Option<String> {
        if ctx.emergency_latched {
            return Some("emergency stop latched".to_string());
        }
        if !ctx.global.emergency_stop_enabled {
            return None;
        }
        let drawdown = ctx.portfolio.drawdown_percent();
        let threshold = ctx.global.emergency_stop_threshold_percent;
        (threshold > Decimal::ZERO && drawdown >= threshold)
            .then(|| format!("portfolio drawdown {drawdown}% >= {threshold}%"))
    }

    fn exit_trigger<'a>(
        &self,
        action: Action,
        ctx: &'a RiskContext,
    ) -> Option<(&'a OpenPosition, ExitTrigger)> {
        if action == Action::Buy {
            return None;
        }
        let position = ctx.position.as_ref().filter(|p| p.amount > Decimal::ZERO)?;
        let pnl = position.unrealized_pnl_percent(ctx.price);
        let risk = &ctx.risk;

        let trigger = if risk.stop_loss_percent > Decimal::ZERO && pnl <= -risk.stop_loss_percent {
            ExitTrigger::StopLoss
        } else if risk.take_profit_percent > Decimal::ZERO && pnl >= risk.take_profit_percent {
            ExitTrigger::TakeProfit
        } else if risk.trailing_stop_enabled
            && risk.trailing_stop_percent > Decimal::ZERO
            && position.peak_price > position.entry_price
            && position.drawdown_from_peak_percent(ctx.price) >= risk.trailing_stop_percent
        {
            ExitTrigger::TrailingStop
        } else {
            return None;
        };
        Some((position, trigger))
    }

    /// Exits bypass the daily and sizing checks but not the emergency stop
    fn gate_exit(
        &self,
        mut intent: TradeIntent,
        position: &OpenPosition,
        trigger: ExitTrigger,
        ctx: &RiskContext,
    ) -> TradeIntent {
        intent.action = Action::Sell;
        intent.exit = Some(trigger);
        let pnl = position.unrealized_pnl_percent(ctx.price).round_dp(2);

        if let Some(note) = self.emergency_blocks(ctx) {
            warn!(symbol = %intent.symbol, %trigger, "Exit rejected: EMERGENCY_STOP ({})", note);
            return intent.reject(RiskReason::EmergencyStop, note);
        }

        info!(
            symbol = %intent.symbol,
            %trigger,
            proposed = %intent.proposed_action,
            "Risk exit: selling {} at {} (P&L {}%)",
            position.amount,
            ctx.price,
            pnl
        );
        let mut intent = intent.approve(position.amount, position.amount * ctx.price);
        intent.note = format!("{trigger} at {pnl}%");
        intent
    }
}
