mod main_runtime;

use clap::Parser;
use quorum::cli::{self, Cli, Commands};
use quorum::config::AppConfig;
use quorum::error::{QuorumError, Result};
use quorum::services::{ApiServer, ApiState};
use quorum::source::{ConfigMutation, ConfigSource, RiskUpdate, StrategyUpdate};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use main_runtime::{build_pipeline, connect, init_logging, init_logging_simple, scheduler, warmer};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load_from(&cli.config)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("\x1b[31m✗ {}\x1b[0m", e);
        }
        return Err(QuorumError::Validation(format!(
            "{} configuration error(s)",
            errors.len()
        )));
    }

    match cli.command {
        Commands::Run { dry_run, no_api } => {
            init_logging(&config.logging);
            run(&config, dry_run, no_api).await?;
        }
        Commands::Once { dry_run } => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            let decision = build_pipeline(&config, &runtime, dry_run).await?;
            let summary = scheduler(&config, &decision.pipeline).run_once().await?;
            let records = decision.audit.recent(summary.instruments, None).await;
            cli::print_outcomes(&records);
            println!(
                "{} instruments: {} decided, {} executed, {} skipped, {} failed",
                summary.instruments,
                summary.completed,
                summary.executed,
                summary.skipped,
                summary.panicked
            );
        }
        Commands::Warm => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            let report = warmer(&config, &runtime.service).warm_once().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.is_complete() {
                return Err(QuorumError::ConfigUnavailable {
                    key: "warm".to_string(),
                    reason: format!("{} fetch(es) failed", report.failures.len()),
                });
            }
        }
        Commands::Validate { json } => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            let mut report = cli::validate_configuration(&runtime.service).await;
            report
                .errors
                .extend(cli::check_config_files(std::path::Path::new(&cli.config)));
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                report.print();
            }
            if !report.is_ok() {
                return Err(QuorumError::Validation(format!(
                    "{} problem(s) found",
                    report.errors.len()
                )));
            }
        }
        Commands::SetActive { symbol, active } => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            runtime.service.set_instrument_active(&symbol, active).await?;
            println!("✓ {symbol} active = {active}");
        }
        Commands::SetStrategy {
            symbol,
            strategy,
            weight,
            enabled,
        } => {
            init_logging_simple();
            let update = Commands::strategy_update(weight, enabled)?;
            let runtime = connect(&config).await?;
            runtime
                .service
                .update_strategy(&symbol, &strategy, &update)
                .await?;
            println!("✓ {symbol}/{strategy} updated");
        }
        Commands::SetRisk {
            symbol,
            stop_loss,
            take_profit,
            max_daily_trades,
            max_daily_loss,
            trailing_stop,
            trailing_stop_percent,
            sizing,
            sizing_percent,
        } => {
            init_logging_simple();
            let update = Commands::risk_update(
                stop_loss,
                take_profit,
                max_daily_trades,
                max_daily_loss,
                trailing_stop,
                trailing_stop_percent,
                sizing.as_deref(),
                sizing_percent,
            )
            .map_err(QuorumError::Validation)?;
            let runtime = connect(&config).await?;
            runtime.service.update_risk(&symbol, &update).await?;
            println!("✓ {symbol} risk config updated");
        }
        Commands::AddPair {
            symbol,
            initial_balance,
            trade_size,
            max_position_percent,
            inactive,
            strategies,
        } => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            let existing = runtime.store.instrument(&symbol).await?;
            let pair = Commands::pair_config(
                existing,
                &symbol,
                initial_balance,
                trade_size,
                max_position_percent,
                inactive,
            )
            .map_err(QuorumError::Validation)?;
            runtime.store.upsert_instrument(&pair).await?;
            runtime.service.invalidate_instrument(&symbol);
            for (name, weight) in &strategies {
                let update = StrategyUpdate {
                    enabled: Some(true),
                    weight: Some(*weight),
                    parameters: None,
                };
                runtime.service.update_strategy(&symbol, name, &update).await?;
            }
            // Creates the default risk row when none exists yet
            runtime
                .service
                .update_risk(&symbol, &RiskUpdate::default())
                .await?;
            println!(
                "✓ {symbol} registered ({} strategies, active = {})",
                strategies.len(),
                pair.active
            );
        }
        Commands::List { symbol, json } => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            let pairs: Vec<_> = runtime
                .store
                .all_instruments()
                .await?
                .into_iter()
                .filter(|p| symbol.as_ref().map_or(true, |s| &p.symbol == s))
                .collect();
            let rows = cli::list_instruments(pairs, &runtime.service).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&rows)?);
            } else {
                cli::print_pairs(&rows);
            }
        }
        Commands::SetConfig { key, value, kind } => {
            init_logging_simple();
            let value = Commands::setting_value(&value, &kind).map_err(QuorumError::Validation)?;
            let runtime = connect(&config).await?;
            runtime.service.set_system_setting(&key, &value).await?;
            println!("✓ {key} = {} ({})", value.to_raw(), value.type_name());
        }
        Commands::ClearCache { symbol } => {
            init_logging_simple();
            let runtime = connect(&config).await?;
            let target = symbol.clone().unwrap_or_else(|| "all instruments".to_string());
            runtime
                .store
                .notify(&ConfigMutation::Flush { symbol })
                .await?;
            println!("✓ cache flush requested for {target}");
        }
    }

    Ok(())
}

async fn run(config: &AppConfig, dry_run: bool, no_api: bool) -> Result<()> {
    info!("Starting decision engine");
    let runtime = connect(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut handles = Vec::new();
    handles.push(runtime.store.spawn_change_listener().await?);
    if let Some(handle) = runtime
        .service
        .spawn_invalidation_listener(shutdown_rx.clone())
    {
        handles.push(handle);
    }

    let decision = build_pipeline(config, &runtime, dry_run).await?;
    if config.warmer.enabled {
        let warmer = warmer(config, &runtime.service).with_metrics(Arc::clone(&decision.metrics));
        handles.push(warmer.spawn(shutdown_rx.clone()));
    } else {
        warn!("Cache warmer disabled; the first cycle reads through to the database");
    }
    handles.push(scheduler(config, &decision.pipeline).spawn(shutdown_rx.clone()));

    if !no_api {
        let state = Arc::new(ApiState::new(
            Arc::clone(&runtime.service),
            Arc::clone(&decision.audit),
            Arc::clone(&decision.metrics),
            decision.emergency.clone(),
            Duration::from_secs(config.scheduler.check_interval_secs),
        ));
        let server = ApiServer::new(state, config.api_port.unwrap_or(8080));
        let api_shutdown = shutdown_rx.clone();
        handles.push(tokio::spawn(async move {
            if let Err(e) = server.run(api_shutdown).await {
                error!("API server stopped: {}", e);
            }
        }));
    }

    signal::ctrl_c().await?;
    info!("Shutdown signal received");
    let _ = shutdown_tx.send(true);

    // The Postgres change listener has no shutdown hook
    let listener = handles.remove(0);
    listener.abort();
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("Task ended abnormally: {}", e);
        }
    }
    decision.metrics.log_status();
    info!("Decision engine stopped");
    Ok(())
}
