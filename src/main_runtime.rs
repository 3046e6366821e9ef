use chrono::Utc;
use quorum::cache::{CacheStore, ConfigService, Warmer};
use quorum::config::{AppConfig, LoggingConfig};
use quorum::domain::GlobalRiskConfig;
use quorum::error::Result;
use quorum::pipeline::{
    DecisionPipeline, FillJournal, JsonSnapshotFile, PaperExecutor, PaperLedger, Scheduler,
};
use quorum::services::{DecisionAudit, Metrics};
use quorum::source::{ConfigSource, PostgresStore};
use quorum::risk::EmergencyStop;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub fn init_logging(logging: &LoggingConfig) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let level = if logging.level.is_empty() {
        "info"
    } else {
        logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{level},quorum=debug,sqlx=warn")));

    let log_dir = std::env::var("QUORUM_LOG_DIR")
        .or_else(|_| std::env::var("LOG_DIR"))
        .unwrap_or_else(|_| "logs".to_string());

    // `rolling::daily` panics if it cannot create the first file, so check
    // the directory is writable before handing it over.
    let file_layer = if std::fs::create_dir_all(&log_dir).is_ok() {
        let test_path = std::path::Path::new(&log_dir).join(".quorum_write_test");
        match std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&test_path)
        {
            Ok(_) => {
                let _ = std::fs::remove_file(&test_path);

                let file_appender = tracing_appender::rolling::daily(&log_dir, "quorum.log");
                let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

                // Long-running process: the guard lives until exit
                Box::leak(Box::new(guard));

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!(
                    "Warning: Could not write to log directory {} ({}), file logging disabled",
                    log_dir, e
                );
                None
            }
        }
    } else {
        eprintln!(
            "Warning: Could not create log directory {}, file logging disabled",
            log_dir
        );
        None
    };

    let (console_plain, console_json) = if logging.json {
        (None, Some(tracing_subscriber::fmt::layer().json().with_target(true)))
    } else {
        (
            Some(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            ),
            None,
        )
    };

    let file_logging_enabled = file_layer.is_some();
    tracing_subscriber::registry()
        .with(filter)
        .with(console_plain)
        .with(console_json)
        .with(file_layer)
        .init();

    if file_logging_enabled {
        eprintln!("Logging to: {}/quorum.log", log_dir);
    }
}

pub fn init_logging_simple() {
    // Minimal logging for one-shot commands
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::WARN)
        .try_init();
}

/// Database-backed configuration access shared by every command
pub struct ConfigRuntime {
    pub store: Arc<PostgresStore>,
    pub service: Arc<ConfigService>,
}

pub async fn connect(config: &AppConfig) -> Result<ConfigRuntime> {
    let store = Arc::new(
        PostgresStore::new(&config.database.url, config.database.max_connections).await?,
    );
    store.migrate().await?;

    let cache = Arc::new(CacheStore::new(config.cache.default_ttl()));
    let service = Arc::new(ConfigService::new(
        cache,
        Arc::clone(&store) as Arc<dyn ConfigSource>,
        config.cache.fetch_timeout(),
        GlobalRiskConfig::from(&config.risk),
    ));
    Ok(ConfigRuntime { store, service })
}

pub fn warmer(config: &AppConfig, service: &Arc<ConfigService>) -> Warmer {
    Warmer::new(
        Arc::clone(service),
        Duration::from_secs(config.warmer.interval_secs),
        Duration::from_secs(config.cache.sweep_interval_secs),
        Duration::from_millis(config.warmer.fetch_timeout_ms),
    )
}

/// Everything the scheduler needs, wired against the paper ledger
pub struct DecisionRuntime {
    pub pipeline: Arc<DecisionPipeline>,
    pub audit: Arc<DecisionAudit>,
    pub metrics: Arc<Metrics>,
    pub emergency: EmergencyStop,
}

pub async fn build_pipeline(
    config: &AppConfig,
    runtime: &ConfigRuntime,
    dry_run: bool,
) -> Result<DecisionRuntime> {
    let ledger = PaperLedger::new(config.paper.starting_balance);
    let journal = Arc::clone(&runtime.store) as Arc<dyn FillJournal>;
    match journal.fills_on(Utc::now().date_naive()).await {
        Ok(fills) => {
            ledger.replay(&fills).await;
        }
        Err(e) => warn!("Could not replay today's fills, daily limits start from zero: {}", e),
    }

    let executor = PaperExecutor::new(ledger.clone()).with_journal(journal);
    let dry_run = dry_run || !config.paper.enabled;
    if dry_run {
        info!("Dry run: intents are decided and audited but not executed");
    }

    let audit = Arc::new(DecisionAudit::default());
    let metrics = Arc::new(Metrics::new());
    let emergency = EmergencyStop::new();
    let pipeline = DecisionPipeline::new(
        Arc::clone(&runtime.service),
        Arc::new(JsonSnapshotFile::new(&config.market_data.snapshot_path)),
        Arc::new(ledger),
        Arc::new(executor),
        config.aggregator.epsilon,
    )
    .with_emergency_stop(emergency.clone())
    .with_audit(Arc::clone(&audit))
    .with_metrics(Arc::clone(&metrics))
    .with_timeouts(
        Duration::from_millis(config.scheduler.market_data_timeout_ms),
        Duration::from_millis(config.scheduler.history_timeout_ms),
    )
    .with_dry_run(dry_run);

    Ok(DecisionRuntime {
        pipeline: Arc::new(pipeline),
        audit,
        metrics,
        emergency,
    })
}

pub fn scheduler(config: &AppConfig, pipeline: &Arc<DecisionPipeline>) -> Scheduler {
    Scheduler::new(
        Arc::clone(pipeline),
        Duration::from_secs(config.scheduler.check_interval_secs),
        config.scheduler.max_concurrent_instruments,
    )
}
