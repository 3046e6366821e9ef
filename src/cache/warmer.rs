//! Background cache warming
//!
//! Keeps the working set (active instruments with their strategy lists and
//! risk configs, plus global risk) resident so steady-state reads are hits.
//! A pass never holds a lock beyond the `set` of one entry, and one
//! instrument failing does not stop the others. Instruments are fetched
//! concurrently.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::keys;
use super::service::{ConfigEntry, ConfigService};
use crate::error::{QuorumError, Result};
use crate::services::Metrics;

/// One instrument (or the global scope, `*`) that could not be warmed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WarmFailure {
    pub symbol: String,
    pub reason: String,
}

/// Outcome of one warm pass
#[derive(Debug, Clone, Serialize)]
pub struct WarmReport {
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub active_instruments: usize,
    pub instruments_warmed: usize,
    pub strategy_lists: usize,
    pub risk_configs: usize,
    pub global_risk: bool,
    pub failures: Vec<WarmFailure>,
}

impl WarmReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Which of one instrument's entries made it into the cache
#[derive(Debug, Default)]
struct Warmed {
    instrument: bool,
    strategies: bool,
    risk: bool,
}

pub struct Warmer {
    config: Arc<ConfigService>,
    interval: Duration,
    sweep_interval: Duration,
    fetch_timeout: Duration,
    metrics: Option<Arc<Metrics>>,
}

impl Warmer {
    pub fn new(
        config: Arc<ConfigService>,
        interval: Duration,
        sweep_interval: Duration,
        fetch_timeout: Duration,
    ) -> Self {
        Self {
            config,
            interval,
            sweep_interval,
            fetch_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn bounded<T, Fut>(&self, what: &str, fut: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.fetch_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(QuorumError::ConfigTimeout {
                key: what.to_string(),
                timeout_ms: self.fetch_timeout.as_millis() as u64,
            }),
        }
    }

    /// Run one full pass against the config source
    pub async fn warm_once(&self) -> WarmReport {
        let started = Instant::now();
        let source = Arc::clone(self.config.source());
        let cache = Arc::clone(self.config.cache());

        let mut report = WarmReport {
            started_at: Utc::now(),
            duration_ms: 0,
            active_instruments: 0,
            instruments_warmed: 0,
            strategy_lists: 0,
            risk_configs: 0,
            global_risk: false,
            failures: Vec::new(),
        };

        let defaults = self.config.global_defaults().clone();
        match self
            .bounded(keys::GLOBAL_RISK, source.global_risk_config(&defaults))
            .await
        {
            Ok(global) => {
                cache.set(keys::GLOBAL_RISK, ConfigEntry::Global(global));
                report.global_risk = true;
            }
            Err(e) => {
                warn!("Warm: global risk config failed: {}", e);
                report.failures.push(WarmFailure {
                    symbol: "*".to_string(),
                    reason: e.to_string(),
                });
            }
        }

        let symbols = match self
            .bounded(keys::ACTIVE_INSTRUMENTS, source.active_instruments())
            .await
        {
            Ok(symbols) => symbols,
            Err(e) => {
                error!("Warm: cannot enumerate active instruments: {}", e);
                report.failures.push(WarmFailure {
                    symbol: "*".to_string(),
                    reason: e.to_string(),
                });
                return self.finish(report, started);
            }
        };
        cache.set(
            keys::ACTIVE_INSTRUMENTS,
            ConfigEntry::ActiveSymbols(symbols.clone()),
        );
        report.active_instruments = symbols.len();

        let results = join_all(symbols.iter().map(|symbol| self.warm_instrument(symbol))).await;
        for (symbol, (warmed, result)) in symbols.iter().zip(results) {
            report.instruments_warmed += usize::from(warmed.instrument);
            report.strategy_lists += usize::from(warmed.strategies);
            report.risk_configs += usize::from(warmed.risk);
            if let Err(e) = result {
                warn!(symbol = %symbol, "Warm: instrument skipped: {}", e);
                report.failures.push(WarmFailure {
                    symbol: symbol.clone(),
                    reason: e.to_string(),
                });
            }
        }

        self.finish(report, started)
    }

    async fn warm_instrument(&self, symbol: &str) -> (Warmed, Result<()>) {
        let mut warmed = Warmed::default();
        let result = self.warm_parts(symbol, &mut warmed).await;
        (warmed, result)
    }

    async fn warm_parts(&self, symbol: &str, warmed: &mut Warmed) -> Result<()> {
        let source = self.config.source();
        let cache = self.config.cache();

        let instrument = self
            .bounded(&keys::instrument(symbol), source.instrument(symbol))
            .await?
            .ok_or_else(|| QuorumError::InstrumentNotFound(symbol.to_string()))?;
        cache.set(keys::instrument(symbol), ConfigEntry::Instrument(instrument));
        warmed.instrument = true;

        let strategies = self
            .bounded(&keys::strategies(symbol), source.strategies(symbol))
            .await?;
        cache.set(keys::strategies(symbol), ConfigEntry::Strategies(strategies));
        warmed.strategies = true;

        let risk = self
            .bounded(&keys::risk(symbol), source.risk_config(symbol))
            .await?
            .ok_or_else(|| QuorumError::RiskConfigMissing(symbol.to_string()))?;
        cache.set(keys::risk(symbol), ConfigEntry::Risk(risk));
        warmed.risk = true;

        debug!(symbol, "warmed instrument");
        Ok(())
    }

    fn finish(&self, mut report: WarmReport, started: Instant) -> WarmReport {
        report.duration_ms = started.elapsed().as_millis() as u64;
        if let Some(metrics) = &self.metrics {
            metrics.record_warm(report.is_complete());
        }
        if report.is_complete() {
            info!(
                instruments = report.instruments_warmed,
                duration_ms = report.duration_ms,
                "Cache warm pass complete"
            );
        } else {
            warn!(
                instruments = report.instruments_warmed,
                failures = report.failures.len(),
                duration_ms = report.duration_ms,
                "Cache warm pass finished with failures"
            );
        }
        report
    }

    /// Warm immediately, then on every interval tick until shutdown.
    /// Expired entries are swept on a separate, shorter tick.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                "Cache warmer started"
            );
            let mut warm_tick = tokio::time::interval(self.interval);
            warm_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sweep_tick = tokio::time::interval(self.sweep_interval);
            sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    // First tick completes immediately: the startup pass
                    _ = warm_tick.tick() => {
                        self.warm_once().await;
                    }
                    _ = sweep_tick.tick() => {
                        let swept = self.config.cache().sweep();
                        if swept > 0 {
                            debug!(swept, "swept expired cache entries");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Cache warmer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheStore;
    use crate::domain::{GlobalRiskConfig, InstrumentConfig, RiskConfig, StrategyConfig};
    use crate::source::{ConfigSource, InMemoryConfigSource, MockConfigSource};
    use rust_decimal_macros::dec;

    fn warmer_for(source: Arc<dyn ConfigSource>) -> Warmer {
        let service = Arc::new(ConfigService::new(
            Arc::new(CacheStore::default()),
            source,
            Duration::from_secs(1),
            GlobalRiskConfig::default(),
        ));
        Warmer::new(
            service,
            Duration::from_secs(3600),
            Duration::from_secs(60),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn test_full_pass_populates_working_set() {
        let source = Arc::new(InMemoryConfigSource::new());
        for symbol in ["A/USD", "B/USD"] {
            source
                .upsert_instrument(
                    InstrumentConfig::with_defaults(symbol),
                    vec![StrategyConfig::new("rsi", dec!(1))],
                    Some(RiskConfig::default()),
                )
                .await;
        }
        let warmer = warmer_for(source.clone());

        let report = warmer.warm_once().await;
        assert!(report.is_complete());
        assert_eq!(report.instruments_warmed, 2);
        assert_eq!(report.risk_configs, 2);
        assert!(report.global_risk);

        // Everything is now a hit
        let fetched = source.fetch_count();
        warmer.config.risk_config("A/USD").await.unwrap();
        warmer.config.strategies("B/USD").await.unwrap();
        warmer.config.global_risk().await.unwrap();
        assert_eq!(source.fetch_count(), fetched);
    }

    #[tokio::test]
    async fn test_one_failing_instrument_does_not_abort_pass() {
        let mut mock = MockConfigSource::new();
        mock.expect_global_risk_config()
            .returning(|d| Ok(d.clone()));
        mock.expect_active_instruments()
            .returning(|| Ok(vec!["BAD/USD".to_string(), "GOOD/USD".to_string()]));
        mock.expect_instrument().returning(|symbol| {
            if symbol == "BAD/USD" {
                Err(QuorumError::Internal("row lock timeout".into()))
            } else {
                Ok(Some(InstrumentConfig::with_defaults(symbol)))
            }
        });
        mock.expect_strategies().returning(|_| Ok(vec![]));
        mock.expect_risk_config()
            .returning(|_| Ok(Some(RiskConfig::default())));

        let warmer = warmer_for(Arc::new(mock));
        let report = warmer.warm_once().await;

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].symbol, "BAD/USD");
        assert_eq!(report.instruments_warmed, 1);
        assert!(warmer
            .config
            .cache()
            .get(&keys::risk("GOOD/USD"))
            .is_some());
    }

    #[tokio::test]
    async fn test_source_down_reports_global_failure() {
        let source = Arc::new(InMemoryConfigSource::new());
        source.set_unavailable(true);
        let warmer = warmer_for(source);

        let report = warmer.warm_once().await;
        assert!(!report.is_complete());
        assert!(report.failures.iter().all(|f| f.symbol == "*"));
        assert_eq!(report.instruments_warmed, 0);
    }

    #[tokio::test]
    async fn test_spawned_warmer_runs_at_startup_and_stops() {
        let source = Arc::new(InMemoryConfigSource::new());
        source
            .upsert_instrument(
                InstrumentConfig::with_defaults("A/USD"),
                vec![],
                Some(RiskConfig::default()),
            )
            .await;
        let warmer = warmer_for(source);
        let cache = Arc::clone(warmer.config.cache());
        let (tx, rx) = watch::channel(false);
        let handle = warmer.spawn(rx);

        let mut warmed = false;
        for _ in 0..50 {
            if cache.get(&keys::risk("A/USD")).is_some() {
                warmed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(warmed);

        tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
