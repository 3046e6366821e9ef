//! One instrument's decision cycle
//!
//! Strictly sequential: config reads, market snapshot, strategy votes,
//! aggregation, history, risk gate, execution, audit. Configuration is
//! never guessed; a failed read skips the cycle with an error.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

use super::executor::{ExecutionReport, Executor};
use super::history::TradeHistory;
use super::market::MarketDataSource;
use crate::cache::{keys, ConfigService};
use crate::domain::{AggregateDecision, RiskReason, TradeIntent};
use crate::error::{QuorumError, Result};
use crate::risk::{EmergencyReason, EmergencyStop, RiskContext, RiskGate};
use crate::services::{AuditRecord, DecisionAudit, Metrics};
use crate::strategy::{collect_votes, SignalAggregator};

const DEFAULT_MARKET_TIMEOUT: Duration = Duration::from_millis(3000);
const DEFAULT_HISTORY_TIMEOUT: Duration = Duration::from_millis(2000);

/// Result of a completed cycle
#[derive(Debug, Clone, Serialize)]
pub struct CycleOutcome {
    pub symbol: String,
    pub decision: AggregateDecision,
    pub intent: TradeIntent,
    pub execution: Option<ExecutionReport>,
    pub execution_error: Option<String>,
}

impl CycleOutcome {
    pub fn executed(&self) -> bool {
        self.execution.is_some()
    }
}

pub struct DecisionPipeline {
    config: Arc<ConfigService>,
    aggregator: SignalAggregator,
    gate: RiskGate,
    market: Arc<dyn MarketDataSource>,
    history: Arc<dyn TradeHistory>,
    executor: Arc<dyn Executor>,
    emergency: EmergencyStop,
    audit: Arc<DecisionAudit>,
    metrics: Arc<Metrics>,
    market_timeout: Duration,
    history_timeout: Duration,
    /// Decide and audit only; nothing reaches the executor
    dry_run: bool,
}

impl DecisionPipeline {
    pub fn new(
        config: Arc<ConfigService>,
        market: Arc<dyn MarketDataSource>,
        history: Arc<dyn TradeHistory>,
        executor: Arc<dyn Executor>,
        epsilon: Decimal,
    ) -> Self {
        Self {
            aggregator: SignalAggregator::new(Arc::clone(&config), epsilon),
            config,
            gate: RiskGate::new(),
            market,
            history,
            executor,
            emergency: EmergencyStop::new(),
            audit: Arc::new(DecisionAudit::default()),
            metrics: Arc::new(Metrics::new()),
            market_timeout: DEFAULT_MARKET_TIMEOUT,
            history_timeout: DEFAULT_HISTORY_TIMEOUT,
            dry_run: false,
        }
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_emergency_stop(mut self, emergency: EmergencyStop) -> Self {
        self.emergency = emergency;
        self
    }

    pub fn with_audit(mut self, audit: Arc<DecisionAudit>) -> Self {
        self.audit = audit;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn with_timeouts(mut self, market: Duration, history: Duration) -> Self {
        self.market_timeout = market;
        self.history_timeout = history;
        self
    }

    pub fn config(&self) -> &Arc<ConfigService> {
        &self.config
    }

    pub fn emergency_stop(&self) -> &EmergencyStop {
        &self.emergency
    }

    pub fn audit(&self) -> &Arc<DecisionAudit> {
        &self.audit
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Run one cycle for `symbol`. Every error means the cycle was skipped
    /// and no intent was produced.
    #[instrument(skip(self))]
    pub async fn run_cycle(&self, symbol: &str) -> Result<CycleOutcome> {
        match self.decide(symbol).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                self.metrics.inc_cycles_skipped();
                warn!(symbol, kind = e.kind(), "Cycle skipped: {}", e);
                Err(e)
            }
        }
    }

    async fn decide(&self, symbol: &str) -> Result<CycleOutcome> {
        // 1. configuration
        let instrument = self.config.instrument(symbol).await?;
        if !instrument.active {
            return Err(QuorumError::ConfigUnavailable {
                key: keys::instrument(symbol),
                reason: "instrument inactive".to_string(),
            });
        }
        let risk = self.config.risk_config(symbol).await?;
        let global = self.config.global_risk().await?;
        let strategies = self.config.strategies(symbol).await?;

        // 2. market data
        let snapshot = bounded(
            self.market_timeout,
            "market snapshot",
            QuorumError::MarketDataUnavailable,
            self.market.snapshot(symbol),
        )
        .await?;
        if snapshot.price <= Decimal::ZERO {
            return Err(QuorumError::MarketDataUnavailable(format!(
                "non-positive price {} for {symbol}",
                snapshot.price
            )));
        }

        // 3-4. votes and aggregation
        let votes = collect_votes(&strategies, &snapshot);
        let decision = self.aggregator.aggregate(symbol, &votes).await?;

        // 5. history
        let today = Utc::now().date_naive();
        let history = &self.history;
        let (today_counter, portfolio, position) = bounded(
            self.history_timeout,
            "trade history",
            QuorumError::Internal,
            async {
                history.mark_price(symbol, snapshot.price).await?;
                let counter = history.daily_counter(symbol, today).await?;
                let portfolio = history.portfolio_snapshot(today).await?;
                let position = history.open_position(symbol).await?;
                Ok::<_, QuorumError>((counter, portfolio, position))
            },
        )
        .await?;

        // 6. risk gate
        let ctx = RiskContext {
            instrument,
            risk,
            global,
            portfolio,
            today: today_counter,
            position,
            price: snapshot.price,
            volatility: snapshot.volatility,
            emergency_latched: self.emergency.is_active(),
        };
        let intent = self.gate.evaluate(&decision, &ctx);

        // 7. latch on drawdown
        if intent.reason == Some(RiskReason::EmergencyStop) && !ctx.emergency_latched {
            self.emergency
                .trip(
                    EmergencyReason::Drawdown {
                        drawdown_percent: ctx.portfolio.drawdown_percent(),
                        threshold_percent: ctx.global.emergency_stop_threshold_percent,
                    },
                    Some(format!("tripped by {symbol} cycle: {}", intent.note)),
                )
                .await;
        }

        // 8. execution
        let (execution, execution_error) = if intent.is_actionable() && !self.dry_run {
            match self.executor.submit(&intent).await {
                Ok(report) => {
                    self.metrics.inc_executed();
                    (Some(report), None)
                }
                Err(e) => {
                    self.metrics.inc_execution_failures();
                    warn!(symbol, action = %intent.action, "Execution failed: {}", e);
                    (None, Some(e.to_string()))
                }
            }
        } else {
            (None, None)
        };

        // 9. audit
        self.metrics.record_intent(&intent);
        self.metrics.inc_cycles_run();
        info!(
            symbol,
            proposed = %decision.action,
            score = %decision.score,
            action = %intent.action,
            verdict = %intent.verdict,
            reason = intent.reason.map(|r| r.code()).unwrap_or("-"),
            executed = execution.is_some(),
            "Cycle complete"
        );
        self.audit
            .record(AuditRecord {
                symbol: symbol.to_string(),
                decision: decision.clone(),
                intent: intent.clone(),
                executed: execution.is_some(),
                execution_error: execution_error.clone(),
                recorded_at: Utc::now(),
            })
            .await;

        Ok(CycleOutcome {
            symbol: symbol.to_string(),
            decision,
            intent,
            execution,
            execution_error,
        })
    }
}

async fn bounded<T, F>(
    limit: Duration,
    what: &str,
    on_timeout: fn(String) -> QuorumError,
    fut: F,
) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            debug!("{} timed out after {:?}", what, limit);
            Err(on_timeout(format!(
                "{what} timed out after {}ms",
                limit.as_millis()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Action, InstrumentConfig, RiskConfig, StrategyConfig, Verdict};
    use crate::pipeline::{PaperExecutor, PaperLedger, StaticMarketData};
    use crate::cache::CacheStore;
    use crate::domain::GlobalRiskConfig;
    use crate::source::{ConfigSource, InMemoryConfigSource};
    use crate::strategy::IndicatorSnapshot;
    use rust_decimal_macros::dec;

    const SYM: &str = "BTC/USD";

    struct Harness {
        source: Arc<InMemoryConfigSource>,
        market: Arc<StaticMarketData>,
        ledger: PaperLedger,
        pipeline: DecisionPipeline,
    }

    async fn harness() -> Harness {
        let source = Arc::new(InMemoryConfigSource::new());
        source
            .upsert_instrument(
                InstrumentConfig::with_defaults(SYM),
                vec![StrategyConfig::new("rsi", dec!(1.0))],
                Some(RiskConfig::default()),
            )
            .await;
        let config = Arc::new(ConfigService::new(
            Arc::new(CacheStore::default()),
            Arc::clone(&source) as Arc<dyn ConfigSource>,
            Duration::from_millis(200),
            GlobalRiskConfig::default(),
        ));
        let market = Arc::new(StaticMarketData::new());
        let ledger = PaperLedger::new(dec!(10000));
        let pipeline = DecisionPipeline::new(
            config,
            Arc::clone(&market) as Arc<dyn MarketDataSource>,
            Arc::new(ledger.clone()),
            Arc::new(PaperExecutor::new(ledger.clone())),
            Decimal::ZERO,
        );
        Harness {
            source,
            market,
            ledger,
            pipeline,
        }
    }

    fn oversold(price: Decimal) -> IndicatorSnapshot {
        IndicatorSnapshot::new(SYM, price).with_rsi(20.0, 2.0)
    }

    #[tokio::test]
    async fn test_buy_is_executed_and_audited() {
        let h = harness().await;
        h.market.set(oversold(dec!(100))).await;

        let outcome = h.pipeline.run_cycle(SYM).await.unwrap();
        assert_eq!(outcome.intent.action, Action::Buy);
        assert_eq!(outcome.intent.verdict, Verdict::Approved);
        assert!(outcome.executed());
        assert_eq!(h.ledger.cash().await, dec!(9900));

        let audit = h.pipeline.audit().recent(10, Some(SYM)).await;
        assert_eq!(audit.len(), 1);
        assert!(audit[0].executed);
        assert_eq!(h.pipeline.metrics().snapshot().executed, 1);
    }

    #[tokio::test]
    async fn test_source_outage_skips_cycle() {
        let h = harness().await;
        h.market.set(oversold(dec!(100))).await;
        h.source.set_unavailable(true);

        let err = h.pipeline.run_cycle(SYM).await.unwrap_err();
        assert!(err.is_config_unavailable());
        assert!(h.pipeline.audit().is_empty().await);
        assert_eq!(h.pipeline.metrics().snapshot().cycles_skipped, 1);
    }

    #[tokio::test]
    async fn test_missing_market_data_skips_cycle() {
        let h = harness().await;
        let err = h.pipeline.run_cycle(SYM).await.unwrap_err();
        assert!(matches!(err, QuorumError::MarketDataUnavailable(_)));
        assert_eq!(h.ledger.cash().await, dec!(10000));
    }

    #[tokio::test]
    async fn test_inactive_instrument_skips_cycle() {
        let h = harness().await;
        h.market.set(oversold(dec!(100))).await;
        h.pipeline
            .config()
            .set_instrument_active(SYM, false)
            .await
            .unwrap();
        assert!(h.pipeline.run_cycle(SYM).await.is_err());
    }

    #[tokio::test]
    async fn test_latched_stop_rejects_and_persists() {
        let h = harness().await;
        h.market.set(oversold(dec!(100))).await;
        h.pipeline
            .emergency_stop()
            .trip(EmergencyReason::Manual, None)
            .await;

        let outcome = h.pipeline.run_cycle(SYM).await.unwrap();
        assert_eq!(outcome.intent.verdict, Verdict::Rejected);
        assert_eq!(outcome.intent.reason, Some(RiskReason::EmergencyStop));
        assert!(!outcome.executed());
        assert!(h.pipeline.emergency_stop().is_active());
    }

    #[tokio::test]
    async fn test_dry_run_skips_execution() {
        let mut h = harness().await;
        h.pipeline = h.pipeline.with_dry_run(true);
        h.market.set(oversold(dec!(100))).await;

        let outcome = h.pipeline.run_cycle(SYM).await.unwrap();
        assert!(outcome.intent.is_actionable());
        assert!(!outcome.executed());
        assert_eq!(h.ledger.cash().await, dec!(10000));
    }

    #[tokio::test]
    async fn test_hold_is_audited_but_not_submitted() {
        let h = harness().await;
        h.market.set(IndicatorSnapshot::new(SYM, dec!(100)).with_rsi(50.0, 0.0)).await;

        let outcome = h.pipeline.run_cycle(SYM).await.unwrap();
        assert_eq!(outcome.intent.action, Action::Hold);
        assert!(!outcome.executed());
        assert_eq!(h.pipeline.audit().len().await, 1);
        assert_eq!(h.pipeline.metrics().snapshot().held, 1);
    }
}
