//! In-process config source for tests, dry runs and seeding

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};

use super::{ConfigMutation, ConfigSource, RiskUpdate, StrategyUpdate, MUTATION_CHANNEL_CAPACITY};
use crate::domain::{GlobalRiskConfig, InstrumentConfig, RiskConfig, SettingValue, StrategyConfig};
use crate::error::{QuorumError, Result};

#[derive(Default)]
struct State {
    instruments: BTreeMap<String, InstrumentConfig>,
    strategies: HashMap<String, Vec<StrategyConfig>>,
    risk: HashMap<String, RiskConfig>,
    settings: BTreeMap<String, SettingValue>,
}

/// Config source held in memory; every mutation is broadcast
pub struct InMemoryConfigSource {
    state: RwLock<State>,
    mutations: broadcast::Sender<ConfigMutation>,
    unavailable: AtomicBool,
    latency_ms: AtomicU64,
    fetches: AtomicU64,
}

impl Default for InMemoryConfigSource {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryConfigSource {
    pub fn new() -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State::default()),
            mutations,
            unavailable: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
            fetches: AtomicU64::new(0),
        }
    }

    /// Seed or replace an instrument together with its strategies and risk config
    pub async fn upsert_instrument(
        &self,
        instrument: InstrumentConfig,
        strategies: Vec<StrategyConfig>,
        risk: Option<RiskConfig>,
    ) {
        let symbol = instrument.symbol.clone();
        {
            let mut state = self.state.write().await;
            state.instruments.insert(symbol.clone(), instrument);
            state.strategies.insert(symbol.clone(), strategies);
            match risk {
                Some(risk) => {
                    state.risk.insert(symbol.clone(), risk);
                }
                None => {
                    state.risk.remove(&symbol);
                }
            }
        }
        self.publish(ConfigMutation::Instrument {
            symbol: symbol.clone(),
        });
        self.publish(ConfigMutation::Risk {
            symbol: symbol.clone(),
        });
        self.publish(ConfigMutation::Strategy {
            symbol,
            strategy: "*".to_string(),
        });
    }

    /// Simulate an unreachable store
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every read by `latency`
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of read calls served, for cache-hit assertions
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    fn publish(&self, mutation: ConfigMutation) {
        // No receivers is fine
        let _ = self.mutations.send(mutation);
    }

    async fn before_read(&self, what: &str) -> Result<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QuorumError::ConfigUnavailable {
                key: what.to_string(),
                reason: "config source offline".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigSource for InMemoryConfigSource {
    async fn active_instruments(&self) -> Result<Vec<String>> {
        self.before_read("active_instruments").await?;
        let state = self.state.read().await;
        Ok(state
            .instruments
            .values()
            .filter(|i| i.active)
            .map(|i| i.symbol.clone())
            .collect())
    }

    async fn instrument(&self, symbol: &str) -> Result<Option<InstrumentConfig>> {
        self.before_read(symbol).await?;
        Ok(self.state.read().await.instruments.get(symbol).cloned())
    }

    async fn strategies(&self, symbol: &str) -> Result<Vec<StrategyConfig>> {
        self.before_read(symbol).await?;
        Ok(self
            .state
            .read()
            .await
            .strategies
            .get(symbol)
            .cloned()
            .unwrap_or_default())
    }

    async fn risk_config(&self, symbol: &str) -> Result<Option<RiskConfig>> {
        self.before_read(symbol).await?;
        Ok(self.state.read().await.risk.get(symbol).cloned())
    }

    async fn global_risk_config(&self, defaults: &GlobalRiskConfig) -> Result<GlobalRiskConfig> {
        self.before_read("global_risk").await?;
        let state = self.state.read().await;
        let (global, problems) = defaults
            .clone()
            .apply_settings(state.settings.iter().map(|(k, v)| (k.as_str(), v)));
        for problem in problems {
            tracing::warn!("{problem}");
        }
        Ok(global)
    }

    async fn set_instrument_active(&self, symbol: &str, active: bool) -> Result<()> {
        {
            let mut state = self.state.write().await;
            let instrument = state
                .instruments
                .get_mut(symbol)
                .ok_or_else(|| QuorumError::InstrumentNotFound(symbol.to_string()))?;
            instrument.active = active;
        }
        self.publish(ConfigMutation::Instrument {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    async fn update_strategy(
        &self,
        symbol: &str,
        strategy: &str,
        update: &StrategyUpdate,
    ) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.instruments.contains_key(symbol) {
                return Err(QuorumError::InstrumentNotFound(symbol.to_string()));
            }
            let links = state.strategies.entry(symbol.to_string()).or_default();
            match links.iter_mut().find(|s| s.strategy_name == strategy) {
                Some(existing) => *existing = update.apply(strategy, Some(existing.clone())),
                None => links.push(update.apply(strategy, None)),
            }
        }
        self.publish(ConfigMutation::Strategy {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
        });
        Ok(())
    }

    async fn update_risk(&self, symbol: &str, update: &RiskUpdate) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if !state.instruments.contains_key(symbol) {
                return Err(QuorumError::InstrumentNotFound(symbol.to_string()));
            }
            let existing = state.risk.get(symbol).cloned();
            state.risk.insert(symbol.to_string(), update.apply(existing));
        }
        self.publish(ConfigMutation::Risk {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    async fn set_system_setting(&self, key: &str, value: &SettingValue) -> Result<()> {
        self.state
            .write()
            .await
            .settings
            .insert(key.to_string(), value.clone());
        self.publish(ConfigMutation::Global);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ConfigMutation>> {
        Some(self.mutations.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn test_mutations_are_broadcast() {
        let source = InMemoryConfigSource::new();
        source
            .upsert_instrument(
                InstrumentConfig::with_defaults("X/USD"),
                vec![StrategyConfig::new("rsi", dec!(1))],
                Some(RiskConfig::default()),
            )
            .await;

        let mut rx = source.subscribe().unwrap();
        source
            .update_strategy(
                "X/USD",
                "rsi",
                &StrategyUpdate {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(
            rx.recv().await.unwrap(),
            ConfigMutation::Strategy {
                symbol: "X/USD".into(),
                strategy: "rsi".into()
            }
        );
        let links = source.strategies("X/USD").await.unwrap();
        assert_eq!(links.len(), 1);
        assert!(!links[0].enabled);
    }

    #[tokio::test]
    async fn test_unavailable_source_errors() {
        let source = InMemoryConfigSource::new();
        source.set_unavailable(true);
        let err = source.active_instruments().await.unwrap_err();
        assert!(err.is_config_unavailable());
    }

    #[tokio::test]
    async fn test_unknown_instrument_update_fails() {
        let source = InMemoryConfigSource::new();
        let err = source
            .update_risk("NOPE/USD", &RiskUpdate::default())
            .await
            .unwrap_err();
        assert!(matches!(err, QuorumError::InstrumentNotFound(_)));
    }
}
