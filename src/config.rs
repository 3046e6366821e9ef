use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub warmer: WarmerConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub risk: RiskDefaults,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub paper: PaperConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Observability API port (default: 8080)
    #[serde(default)]
    pub api_port: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Default entry TTL in seconds
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,
    /// Bound on a read-through fetch after a miss
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// How often expired entries are physically removed
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

fn default_fetch_timeout_ms() -> u64 {
    2000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WarmerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Seconds between warm passes (one hour by default)
    #[serde(default = "default_warm_interval_secs")]
    pub interval_secs: u64,
    /// Bound on each individual fetch during a pass
    #[serde(default = "default_warm_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

fn default_warm_interval_secs() -> u64 {
    3600
}

fn default_warm_fetch_timeout_ms() -> u64 {
    5000
}

impl Default for WarmerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_warm_interval_secs(),
            fetch_timeout_ms: default_warm_fetch_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AggregatorConfig {
    /// Dead band around zero inside which the weighted score resolves to HOLD
    #[serde(default)]
    pub epsilon: Decimal,
}

/// Portfolio-wide risk defaults, used when the config source has no
/// system setting for a key.
#[derive(Debug, Clone, Deserialize)]
pub struct RiskDefaults {
    #[serde(default = "default_global_max_daily_loss_percent")]
    pub global_max_daily_loss_percent: Decimal,
    #[serde(default = "default_true")]
    pub emergency_stop_enabled: bool,
    #[serde(default = "default_emergency_stop_threshold_percent")]
    pub emergency_stop_threshold_percent: Decimal,
    #[serde(default = "default_true")]
    pub correlation_check_enabled: bool,
    #[serde(default = "default_total_portfolio_balance")]
    pub total_portfolio_balance: Decimal,
    #[serde(default = "default_max_concurrent_positions")]
    pub max_concurrent_positions: u32,
}

fn default_global_max_daily_loss_percent() -> Decimal {
    Decimal::from(10)
}

fn default_emergency_stop_threshold_percent() -> Decimal {
    Decimal::from(20)
}

fn default_total_portfolio_balance() -> Decimal {
    Decimal::from(10_000)
}

fn default_max_concurrent_positions() -> u32 {
    3
}

impl Default for RiskDefaults {
    fn default() -> Self {
        Self {
            global_max_daily_loss_percent: default_global_max_daily_loss_percent(),
            emergency_stop_enabled: true,
            emergency_stop_threshold_percent: default_emergency_stop_threshold_percent(),
            correlation_check_enabled: true,
            total_portfolio_balance: default_total_portfolio_balance(),
            max_concurrent_positions: default_max_concurrent_positions(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between decision cycles
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Upper bound on instrument cycles running at once
    #[serde(default = "default_max_concurrent_instruments")]
    pub max_concurrent_instruments: usize,
    #[serde(default = "default_market_data_timeout_ms")]
    pub market_data_timeout_ms: u64,
    #[serde(default = "default_history_timeout_ms")]
    pub history_timeout_ms: u64,
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_max_concurrent_instruments() -> usize {
    8
}

fn default_market_data_timeout_ms() -> u64 {
    3000
}

fn default_history_timeout_ms() -> u64 {
    2000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval_secs(),
            max_concurrent_instruments: default_max_concurrent_instruments(),
            market_data_timeout_ms: default_market_data_timeout_ms(),
            history_timeout_ms: default_history_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct MarketDataConfig {
    /// JSON file holding one indicator snapshot per symbol
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: String,
}

fn default_snapshot_path() -> String {
    "data/indicators.json".to_string()
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PaperConfig {
    /// Route approved intents to the in-process paper ledger
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_total_portfolio_balance")]
    pub starting_balance: Decimal,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            starting_balance: default_total_portfolio_balance(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.url", "postgres://localhost/quorum")?
            .set_default("database.max_connections", 5)?
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Environment-specific overrides (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("QUORUM_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // QUORUM_CACHE__DEFAULT_TTL_SECS, QUORUM_AGGREGATOR__EPSILON, ...
            .add_source(
                Environment::with_prefix("QUORUM")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// In-code configuration for tests and dry runs
    pub fn default_config() -> Self {
        Self {
            cache: CacheConfig::default(),
            warmer: WarmerConfig::default(),
            aggregator: AggregatorConfig::default(),
            risk: RiskDefaults::default(),
            scheduler: SchedulerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/quorum".to_string(),
                max_connections: 5,
            },
            market_data: MarketDataConfig::default(),
            paper: PaperConfig::default(),
            logging: LoggingConfig::default(),
            api_port: Some(8080),
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        let hundred = Decimal::from(100);

        if self.cache.default_ttl_secs == 0 {
            errors.push("cache.default_ttl_secs must be positive".to_string());
        }
        if self.cache.fetch_timeout_ms == 0 {
            errors.push("cache.fetch_timeout_ms must be positive".to_string());
        }
        if self.cache.sweep_interval_secs == 0 {
            errors.push("cache.sweep_interval_secs must be positive".to_string());
        }
        if self.warmer.interval_secs == 0 {
            errors.push("warmer.interval_secs must be positive".to_string());
        }
        if self.warmer.fetch_timeout_ms == 0 {
            errors.push("warmer.fetch_timeout_ms must be positive".to_string());
        }
        if self.scheduler.check_interval_secs == 0 {
            errors.push("scheduler.check_interval_secs must be positive".to_string());
        }
        if self.scheduler.market_data_timeout_ms == 0 {
            errors.push("scheduler.market_data_timeout_ms must be positive".to_string());
        }
        if self.scheduler.history_timeout_ms == 0 {
            errors.push("scheduler.history_timeout_ms must be positive".to_string());
        }
        if self.scheduler.max_concurrent_instruments == 0 {
            errors.push("scheduler.max_concurrent_instruments must be at least 1".to_string());
        }

        if self.aggregator.epsilon < Decimal::ZERO || self.aggregator.epsilon >= Decimal::ONE {
            errors.push("aggregator.epsilon must be within [0, 1)".to_string());
        }

        let pct = self.risk.global_max_daily_loss_percent;
        if pct <= Decimal::ZERO || pct > hundred {
            errors.push("risk.global_max_daily_loss_percent must be within (0, 100]".to_string());
        }
        let pct = self.risk.emergency_stop_threshold_percent;
        if pct <= Decimal::ZERO || pct > hundred {
            errors.push(
                "risk.emergency_stop_threshold_percent must be within (0, 100]".to_string(),
            );
        }
        if self.risk.total_portfolio_balance <= Decimal::ZERO {
            errors.push("risk.total_portfolio_balance must be positive".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.warmer.interval_secs, 3600);
        assert_eq!(config.aggregator.epsilon, Decimal::ZERO);
    }

    #[test]
    fn test_validate_collects_every_violation() {
        let mut config = AppConfig::default_config();
        config.cache.default_ttl_secs = 0;
        config.aggregator.epsilon = dec!(1.5);
        config.risk.emergency_stop_threshold_percent = dec!(0);

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 3);
    }

    #[test]
    fn test_zero_intervals_and_timeouts_rejected() {
        let cases: [(&str, fn(&mut AppConfig)); 4] = [
            ("cache.sweep_interval_secs", |c| c.cache.sweep_interval_secs = 0),
            ("warmer.fetch_timeout_ms", |c| c.warmer.fetch_timeout_ms = 0),
            ("scheduler.market_data_timeout_ms", |c| {
                c.scheduler.market_data_timeout_ms = 0
            }),
            ("scheduler.history_timeout_ms", |c| c.scheduler.history_timeout_ms = 0),
        ];
        for (field, zero) in cases {
            let mut config = AppConfig::default_config();
            zero(&mut config);
            let errors = config.validate().unwrap_err();
            assert_eq!(errors.len(), 1, "{field}");
            assert!(errors[0].starts_with(field), "{}", errors[0]);
        }
    }
}
