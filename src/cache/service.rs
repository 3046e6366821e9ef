//! Read-through configuration access
//!
//! Every config read in a decision cycle goes through here: a live cache
//! entry is returned as is, a miss is filled from the config source under a
//! timeout. A fetch that fails or times out is an error for the caller; no
//! default or stale value is ever substituted.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::keys;
use super::store::{CacheStats, CacheStore};
use crate::domain::{GlobalRiskConfig, InstrumentConfig, RiskConfig, SettingValue, StrategyConfig};
use crate::error::{QuorumError, Result};
use crate::source::{ConfigMutation, ConfigSource, RiskUpdate, StrategyUpdate};

/// Cached configuration payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ConfigEntry {
    ActiveSymbols(Vec<String>),
    Instrument(InstrumentConfig),
    Strategies(Vec<StrategyConfig>),
    Risk(RiskConfig),
    Global(GlobalRiskConfig),
}

/// Hit/miss counters for read-through lookups
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LookupStats {
    pub hits: u64,
    pub misses: u64,
    pub fetch_failures: u64,
}

/// Cache statistics plus lookup counters, as served to observers
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConfigCacheReport {
    #[serde(flatten)]
    pub cache: CacheStats,
    pub lookups: LookupStats,
}

pub struct ConfigService {
    cache: Arc<CacheStore<ConfigEntry>>,
    source: Arc<dyn ConfigSource>,
    fetch_timeout: Duration,
    global_defaults: GlobalRiskConfig,
    hits: AtomicU64,
    misses: AtomicU64,
    fetch_failures: AtomicU64,
}

impl ConfigService {
    pub fn new(
        cache: Arc<CacheStore<ConfigEntry>>,
        source: Arc<dyn ConfigSource>,
        fetch_timeout: Duration,
        global_defaults: GlobalRiskConfig,
    ) -> Self {
        Self {
            cache,
            source,
            fetch_timeout,
            global_defaults,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fetch_failures: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<CacheStore<ConfigEntry>> {
        &self.cache
    }

    pub fn source(&self) -> &Arc<dyn ConfigSource> {
        &self.source
    }

    pub fn global_defaults(&self) -> &GlobalRiskConfig {
        &self.global_defaults
    }

    pub fn report(&self) -> ConfigCacheReport {
        ConfigCacheReport {
            cache: self.cache.stats(),
            lookups: LookupStats {
                hits: self.hits.load(Ordering::Relaxed),
                misses: self.misses.load(Ordering::Relaxed),
                fetch_failures: self.fetch_failures.load(Ordering::Relaxed),
            },
        }
    }

    // ==================== Typed reads ====================

    pub async fn active_symbols(&self) -> Result<Vec<String>> {
        let source = Arc::clone(&self.source);
        self.read_through(
            keys::ACTIVE_INSTRUMENTS.to_string(),
            |entry| match entry {
                ConfigEntry::ActiveSymbols(v) => Some(v),
                _ => None,
            },
            ConfigEntry::ActiveSymbols,
            move || async move { source.active_instruments().await },
        )
        .await
    }

    pub async fn instrument(&self, symbol: &str) -> Result<InstrumentConfig> {
        let source = Arc::clone(&self.source);
        let sym = symbol.to_string();
        self.read_through(
            keys::instrument(symbol),
            |entry| match entry {
                ConfigEntry::Instrument(v) => Some(v),
                _ => None,
            },
            ConfigEntry::Instrument,
            move || async move {
                source
                    .instrument(&sym)
                    .await?
                    .ok_or(QuorumError::InstrumentNotFound(sym))
            },
        )
        .await
    }

    /// Every strategy link for the instrument, enabled or not
    pub async fn strategies(&self, symbol: &str) -> Result<Vec<StrategyConfig>> {
        let source = Arc::clone(&self.source);
        let sym = symbol.to_string();
        self.read_through(
            keys::strategies(symbol),
            |entry| match entry {
                ConfigEntry::Strategies(v) => Some(v),
                _ => None,
            },
            ConfigEntry::Strategies,
            move || async move { source.strategies(&sym).await },
        )
        .await
    }

    /// Risk config; a missing row is an error, never a default
    pub async fn risk_config(&self, symbol: &str) -> Result<RiskConfig> {
        let source = Arc::clone(&self.source);
        let sym = symbol.to_string();
        self.read_through(
            keys::risk(symbol),
            |entry| match entry {
                ConfigEntry::Risk(v) => Some(v),
                _ => None,
            },
            ConfigEntry::Risk,
            move || async move {
                source
                    .risk_config(&sym)
                    .await?
                    .ok_or(QuorumError::RiskConfigMissing(sym))
            },
        )
        .await
    }

    pub async fn global_risk(&self) -> Result<GlobalRiskConfig> {
        let source = Arc::clone(&self.source);
        let defaults = self.global_defaults.clone();
        self.read_through(
            keys::GLOBAL_RISK.to_string(),
            |entry| match entry {
                ConfigEntry::Global(v) => Some(v),
                _ => None,
            },
            ConfigEntry::Global,
            move || async move { source.global_risk_config(&defaults).await },
        )
        .await
    }

    /// Weights of enabled strategies normalised to sum to 1.
    /// Empty when nothing is enabled or every enabled weight is zero.
    pub async fn strategy_weights(&self, symbol: &str) -> Result<HashMap<String, Decimal>> {
        let strategies = self.strategies(symbol).await?;
        let total: Decimal = strategies
            .iter()
            .filter(|s| s.enabled)
            .map(|s| s.weight)
            .sum();
        if total <= Decimal::ZERO {
            return Ok(HashMap::new());
        }
        Ok(strategies
            .into_iter()
            .filter(|s| s.enabled)
            .map(|s| (s.strategy_name, s.weight / total))
            .collect())
    }

    async fn read_through<T, E, W, F, Fut>(
        &self,
        key: String,
        extract: E,
        wrap: W,
        fetch: F,
    ) -> Result<T>
    where
        T: Clone,
        E: Fn(ConfigEntry) -> Option<T>,
        W: Fn(T) -> ConfigEntry,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(entry) = self.cache.get(&key) {
            match extract(entry) {
                Some(value) => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(value);
                }
                None => {
                    warn!(key = %key, "Cache entry has unexpected shape, refetching");
                    self.cache.delete(&key);
                }
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        debug!(key = %key, "cache miss, fetching from config source");

        let value = match tokio::time::timeout(self.fetch_timeout, fetch()).await {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                return Err(if e.is_config_unavailable() {
                    e
                } else {
                    QuorumError::ConfigUnavailable {
                        key,
                        reason: e.to_string(),
                    }
                });
            }
            Err(_) => {
                self.fetch_failures.fetch_add(1, Ordering::Relaxed);
                return Err(QuorumError::ConfigTimeout {
                    key,
                    timeout_ms: self.fetch_timeout.as_millis() as u64,
                });
            }
        };

        self.cache.set(key, wrap(value.clone()));
        Ok(value)
    }

    // ==================== Invalidation ====================

    /// Drop every key a mutation makes stale
    pub fn invalidate(&self, mutation: &ConfigMutation) -> usize {
        let removed = match mutation {
            ConfigMutation::Flush { symbol: Some(symbol) } => {
                self.invalidate_instrument(symbol)
                    + usize::from(self.cache.delete(keys::ACTIVE_INSTRUMENTS))
            }
            ConfigMutation::Flush { symbol: None } => {
                let removed = self.cache.len();
                self.cache.clear();
                warn!(removed, "config cache flushed");
                removed
            }
            _ => mutation
                .affected_keys()
                .iter()
                .filter(|key| self.cache.delete(key))
                .count(),
        };
        debug!(?mutation, removed, "config cache invalidated");
        removed
    }

    /// Drop an instrument's whole working set
    pub fn invalidate_instrument(&self, symbol: &str) -> usize {
        self.cache.invalidate_pattern(&keys::all_for(symbol))
    }

    pub async fn set_instrument_active(&self, symbol: &str, active: bool) -> Result<()> {
        self.source.set_instrument_active(symbol, active).await?;
        self.invalidate(&ConfigMutation::Instrument {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    pub async fn update_strategy(
        &self,
        symbol: &str,
        strategy: &str,
        update: &StrategyUpdate,
    ) -> Result<()> {
        update.validate()?;
        self.source.update_strategy(symbol, strategy, update).await?;
        self.invalidate(&ConfigMutation::Strategy {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
        });
        Ok(())
    }

    pub async fn update_risk(&self, symbol: &str, update: &RiskUpdate) -> Result<()> {
        self.source.update_risk(symbol, update).await?;
        self.invalidate(&ConfigMutation::Risk {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    pub async fn set_system_setting(&self, key: &str, value: &SettingValue) -> Result<()> {
        self.source.set_system_setting(key, value).await?;
        self.invalidate(&ConfigMutation::Global);
        Ok(())
    }

    /// Apply mutations pushed by the source until shutdown.
    /// Returns `None` when the source has no mutation feed.
    pub fn spawn_invalidation_listener(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Option<JoinHandle<()>> {
        let mut rx = self.source.subscribe()?;
        let service = Arc::clone(self);

        Some(tokio::spawn(async move {
            info!("Config invalidation listener started");
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok(mutation) => {
                            service.invalidate(&mutation);
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Invalidation feed lagged, clearing config cache");
                            service.invalidate(&ConfigMutation::Flush { symbol: None });
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Invalidation feed closed");
                            break;
                        }
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            info!("Config invalidation listener stopped");
        }))
    }
}
