use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::str::FromStr;
use tabled::{Table, Tabled};

use crate::cache::ConfigService;
use crate::domain::{InstrumentConfig, PositionSizingMethod, SettingValue, Verdict};
use crate::services::AuditRecord;
use crate::source::{RiskUpdate, StrategyUpdate};
use crate::strategy::StrategyKind;

#[derive(Parser, Debug)]
#[command(name = "quorum")]
#[command(version, about = "Multi-strategy signal aggregation with layered risk gating", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory holding default.toml and per-environment overrides
    #[arg(short, long, default_value = "config", global = true)]
    pub config: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run warmer, scheduler and API server until Ctrl-C
    Run {
        /// Decide and audit, but never submit intents
        #[arg(long)]
        dry_run: bool,
        /// Do not start the HTTP API
        #[arg(long)]
        no_api: bool,
    },
    /// Run one scheduling round over all active instruments and print the outcomes
    Once {
        #[arg(long)]
        dry_run: bool,
    },
    /// Warm the configuration cache once and print the report
    Warm,
    /// Check the multi-instrument configuration for problems
    Validate {
        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Enable or disable an instrument
    SetActive {
        symbol: String,
        #[arg(action = clap::ArgAction::Set)]
        active: bool,
    },
    /// Change one strategy's participation for an instrument
    SetStrategy {
        symbol: String,
        strategy: String,
        #[arg(long)]
        weight: Option<Decimal>,
        #[arg(long)]
        enabled: Option<bool>,
    },
    /// Change an instrument's risk limits
    SetRisk {
        symbol: String,
        #[arg(long)]
        stop_loss: Option<Decimal>,
        #[arg(long)]
        take_profit: Option<Decimal>,
        #[arg(long)]
        max_daily_trades: Option<u32>,
        #[arg(long)]
        max_daily_loss: Option<Decimal>,
        #[arg(long)]
        trailing_stop: Option<bool>,
        #[arg(long)]
        trailing_stop_percent: Option<Decimal>,
        /// fixed | percent_of_balance | volatility_scaled
        #[arg(long)]
        sizing: Option<String>,
        #[arg(long)]
        sizing_percent: Option<Decimal>,
    },
    /// Register an instrument, or update an existing one, with default risk limits
    AddPair {
        symbol: String,
        #[arg(long)]
        initial_balance: Option<Decimal>,
        #[arg(long)]
        trade_size: Option<Decimal>,
        #[arg(long)]
        max_position_percent: Option<Decimal>,
        /// Register without adding it to the active set
        #[arg(long)]
        inactive: bool,
        /// Strategy participation as name=weight, repeatable
        #[arg(long = "strategy", value_parser = parse_strategy_weight)]
        strategies: Vec<(String, Decimal)>,
    },
    /// List every registered instrument with its strategies and risk limits
    List {
        #[arg(long)]
        symbol: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Write a system setting
    SetConfig {
        key: String,
        value: String,
        /// string | integer | float | boolean | json
        #[arg(long = "type", default_value = "string")]
        kind: String,
    },
    /// Tell every running process to drop cached config
    ClearCache {
        /// Only this instrument's keys (plus the active set)
        #[arg(long)]
        symbol: Option<String>,
    },
}

/// Parse a `name=weight` pair for `add-pair --strategy`
pub fn parse_strategy_weight(raw: &str) -> Result<(String, Decimal), String> {
    let (name, weight) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=weight, got {raw:?}"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing strategy name in {raw:?}"));
    }
    let weight = Decimal::from_str(weight.trim()).map_err(|e| format!("bad weight in {raw:?}: {e}"))?;
    Commands::strategy_update(Some(weight), Some(true)).map_err(|e| e.to_string())?;
    Ok((name.to_string(), weight))
}

impl Commands {
    /// Build the strategy update carried by `set-strategy`
    pub fn strategy_update(
        weight: Option<Decimal>,
        enabled: Option<bool>,
    ) -> crate::error::Result<StrategyUpdate> {
        let update = StrategyUpdate {
            enabled,
            weight,
            parameters: None,
        };
        update.validate()?;
        Ok(update)
    }

    /// Instrument row written by `add-pair`, layered over the stored row if any
    pub fn pair_config(
        existing: Option<InstrumentConfig>,
        symbol: &str,
        initial_balance: Option<Decimal>,
        trade_size: Option<Decimal>,
        max_position_percent: Option<Decimal>,
        inactive: bool,
    ) -> Result<InstrumentConfig, String> {
        if !symbol.contains('/') {
            return Err(format!("symbol {symbol:?} is not BASE/QUOTE"));
        }
        let mut pair = existing.unwrap_or_else(|| InstrumentConfig::with_defaults(symbol));
        for (name, value) in [
            ("initial_balance", initial_balance),
            ("trade_size", trade_size),
            ("max_position_percent", max_position_percent),
        ] {
            if matches!(value, Some(v) if v <= Decimal::ZERO) {
                return Err(format!("{name} must be positive"));
            }
        }
        if let Some(v) = max_position_percent {
            if v > Decimal::ONE_HUNDRED {
                return Err("max_position_percent must be at most 100".to_string());
            }
            pair.max_position_percent = v;
        }
        if let Some(v) = initial_balance {
            pair.initial_balance = v;
        }
        if let Some(v) = trade_size {
            pair.trade_size_usd = v;
        }
        pair.active = !inactive;
        Ok(pair)
    }

    /// Value written by `set-config`
    pub fn setting_value(value: &str, kind: &str) -> Result<SettingValue, String> {
        match kind {
            "string" | "integer" | "float" | "boolean" | "json" => SettingValue::parse(value, kind),
            other => Err(format!("unknown setting type {other:?}")),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn risk_update(
        stop_loss: Option<Decimal>,
        take_profit: Option<Decimal>,
        max_daily_trades: Option<u32>,
        max_daily_loss: Option<Decimal>,
        trailing_stop: Option<bool>,
        trailing_stop_percent: Option<Decimal>,
        sizing: Option<&str>,
        sizing_percent: Option<Decimal>,
    ) -> Result<RiskUpdate, String> {
        let position_sizing_method = sizing.map(PositionSizingMethod::from_str).transpose()?;
        Ok(RiskUpdate {
            stop_loss_percent: stop_loss,
            take_profit_percent: take_profit,
            max_daily_trades,
            max_daily_loss_percent: max_daily_loss,
            trailing_stop_enabled: trailing_stop,
            trailing_stop_percent,
            max_drawdown_percent: None,
            position_sizing_method,
            sizing_percent,
        })
    }
}

// ==================== Validation ====================

#[derive(Debug, Serialize, Tabled)]
pub struct InstrumentRow {
    pub symbol: String,
    pub strategies: String,
    pub weight: String,
    pub risk: String,
    pub allocation: String,
}

#[derive(Debug, Default, Serialize)]
pub struct ValidationReport {
    pub instruments: Vec<InstrumentRow>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn print(&self) {
        if self.instruments.is_empty() {
            println!("(no active instruments)");
        } else {
            println!("{}", Table::new(&self.instruments));
        }
        for w in &self.warnings {
            println!("\x1b[33m⚠ {}\x1b[0m", w);
        }
        for e in &self.errors {
            println!("\x1b[31m✗ {}\x1b[0m", e);
        }
        if self.is_ok() {
            println!("\x1b[32m✓ Configuration is valid\x1b[0m");
        }
    }
}

/// Walk the active set through the cache and report anything that would make
/// a cycle skip or behave unexpectedly.
pub async fn validate_configuration(config: &ConfigService) -> ValidationReport {
    let mut report = ValidationReport::default();

    let global = match config.global_risk().await {
        Ok(global) => Some(global),
        Err(e) => {
            report.errors.push(format!("global risk settings: {e}"));
            None
        }
    };
    if let Some(global) = &global {
        let hundred = Decimal::ONE_HUNDRED;
        if global.emergency_stop_threshold_percent <= Decimal::ZERO
            || global.emergency_stop_threshold_percent > hundred
        {
            report.errors.push(format!(
                "emergency_stop_threshold_percent {} outside (0, 100]",
                global.emergency_stop_threshold_percent
            ));
        }
        if global.global_max_daily_loss_percent <= Decimal::ZERO
            || global.global_max_daily_loss_percent > hundred
        {
            report.errors.push(format!(
                "global_max_daily_loss_percent {} outside (0, 100]",
                global.global_max_daily_loss_percent
            ));
        }
        if global.total_portfolio_balance <= Decimal::ZERO {
            report
                .errors
                .push("total_portfolio_balance must be positive".to_string());
        }
    }

    let symbols = match config.active_symbols().await {
        Ok(symbols) => symbols,
        Err(e) => {
            report.errors.push(format!("active instruments: {e}"));
            return report;
        }
    };
    if symbols.is_empty() {
        report.errors.push("no active instruments".to_string());
        return report;
    }

    let mut total_allocation = Decimal::ZERO;
    let mut total_capital = Decimal::ZERO;
    for symbol in &symbols {
        let instrument = match config.instrument(symbol).await {
            Ok(instrument) => instrument,
            Err(e) => {
                report.errors.push(format!("{symbol}: {e}"));
                continue;
            }
        };
        total_allocation += instrument.max_position_percent;
        total_capital += instrument.initial_balance;

        let strategies = config.strategies(symbol).await.unwrap_or_default();
        let enabled: Vec<_> = strategies.iter().filter(|s| s.enabled).collect();
        if enabled.is_empty() {
            report
                .errors
                .push(format!("{symbol}: no enabled strategies (every cycle will HOLD)"));
        }
        for s in &enabled {
            if StrategyKind::from_str(&s.strategy_name).is_err() {
                report.warnings.push(format!(
                    "{symbol}: strategy '{}' has no evaluator",
                    s.strategy_name
                ));
            }
        }
        let weight: Decimal = enabled.iter().map(|s| s.weight).sum();

        let risk = match config.risk_config(symbol).await {
            Ok(risk) => format!(
                "SL {}% / TP {}% / {} trades",
                risk.stop_loss_percent, risk.take_profit_percent, risk.max_daily_trades
            ),
            Err(e) => {
                report.errors.push(format!("{symbol}: {e}"));
                "missing".to_string()
            }
        };

        report.instruments.push(InstrumentRow {
            symbol: symbol.clone(),
            strategies: format!("{}/{} enabled", enabled.len(), strategies.len()),
            weight: weight.normalize().to_string(),
            risk,
            allocation: format!("{}%", instrument.max_position_percent),
        });
    }

    if total_allocation > Decimal::ONE_HUNDRED {
        report.warnings.push(format!(
            "total max_position_percent across active instruments is {total_allocation}% (> 100%)"
        ));
    }
    if let Some(global) = &global {
        if total_capital > global.total_portfolio_balance {
            report.warnings.push(format!(
                "instrument initial balances sum to {total_capital}, above total_portfolio_balance {}",
                global.total_portfolio_balance
            ));
        }
    }
    report
}

/// Parse every `*.toml` under the config directory, including environment
/// overrides the current run did not load. Returns one error per bad file.
pub fn check_config_files(dir: &Path) -> Vec<String> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => return vec![format!("{}: {e}", dir.display())],
    };
    let mut paths: Vec<_> = entries
        .flatten()
        .map(|entry| entry.path())
        .filter(|path| path.extension().map_or(false, |ext| ext == "toml"))
        .collect();
    paths.sort();

    let mut errors = Vec::new();
    for path in paths {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown".to_string());
        match std::fs::read_to_string(&path) {
            Ok(content) => {
                if let Err(e) = toml::from_str::<toml::Value>(&content) {
                    errors.push(format!("{name}: invalid TOML: {e}"));
                }
            }
            Err(e) => errors.push(format!("{name}: read error: {e}")),
        }
    }
    errors
}

// ==================== Instrument listing ====================

#[derive(Debug, Serialize, Tabled)]
pub struct PairRow {
    pub symbol: String,
    pub active: bool,
    pub balance: String,
    pub trade_size: String,
    /// Enabled strategies with their normalised weights
    pub strategies: String,
    pub risk: String,
}

/// Describe registered instruments through the cache. Lookups that fail are
/// shown inline rather than aborting the listing.
pub async fn list_instruments(
    instruments: Vec<InstrumentConfig>,
    config: &ConfigService,
) -> Vec<PairRow> {
    let mut rows = Vec::with_capacity(instruments.len());
    for pair in instruments {
        let strategies = match config.strategy_weights(&pair.symbol).await {
            Ok(weights) if weights.is_empty() => "(none enabled)".to_string(),
            Ok(weights) => {
                let mut weights: Vec<_> = weights.into_iter().collect();
                weights.sort_by(|a, b| a.0.cmp(&b.0));
                weights
                    .iter()
                    .map(|(name, w)| format!("{name}:{}", w.round_dp(4).normalize()))
                    .collect::<Vec<_>>()
                    .join(", ")
            }
            Err(e) => format!("error: {e}"),
        };
        let risk = match config.risk_config(&pair.symbol).await {
            Ok(risk) => format!(
                "SL {}% / TP {}% / {} trades",
                risk.stop_loss_percent, risk.take_profit_percent, risk.max_daily_trades
            ),
            Err(e) => format!("error: {e}"),
        };
        rows.push(PairRow {
            balance: pair.initial_balance.to_string(),
            trade_size: pair.trade_size_usd.to_string(),
            symbol: pair.symbol,
            active: pair.active,
            strategies,
            risk,
        });
    }
    rows
}

pub fn print_pairs(rows: &[PairRow]) {
    if rows.is_empty() {
        println!("(no instruments)");
    } else {
        println!("{}", Table::new(rows));
    }
}

// ==================== Outcome table ====================

#[derive(Debug, Tabled)]
pub struct OutcomeRow {
    pub symbol: String,
    pub proposed: String,
    pub score: String,
    pub action: String,
    pub verdict: String,
    pub reason: String,
    pub amount: String,
    pub executed: String,
}

impl From<&AuditRecord> for OutcomeRow {
    fn from(r: &AuditRecord) -> Self {
        let i = &r.intent;
        Self {
            symbol: r.symbol.clone(),
            proposed: r.decision.action.to_string(),
            score: r.decision.score.round_dp(4).to_string(),
            action: i.action.to_string(),
            verdict: i.verdict.to_string(),
            reason: i
                .reason
                .map(|reason| reason.code().to_string())
                .or_else(|| i.exit.map(|e| e.to_string()))
                .unwrap_or_else(|| "-".to_string()),
            amount: if i.verdict == Verdict::Approved {
                i.amount.to_string()
            } else {
                "-".to_string()
            },
            executed: match (r.executed, &r.execution_error) {
                (true, _) => "yes".to_string(),
                (false, Some(e)) => format!("failed: {e}"),
                (false, None) => "no".to_string(),
            },
        }
    }
}

pub fn print_outcomes(records: &[AuditRecord]) {
    if records.is_empty() {
        println!("(no results)");
        return;
    }
    let rows: Vec<OutcomeRow> = records.iter().map(OutcomeRow::from).collect();
    println!("{}", Table::new(rows));
}
