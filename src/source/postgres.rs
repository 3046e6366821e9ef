use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgListener, PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::str::FromStr;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::{ConfigMutation, ConfigSource, RiskUpdate, StrategyUpdate, MUTATION_CHANNEL_CAPACITY};
use crate::domain::{
    Action, ExitTrigger, GlobalRiskConfig, InstrumentConfig, PositionSizingMethod, RiskConfig,
    SettingValue, StrategyConfig,
};
use crate::error::{QuorumError, Result};
use crate::pipeline::{Fill, FillJournal};

/// NOTIFY channel fed by the config table triggers
pub const CONFIG_CHANNEL: &str = "quorum_config_changes";

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
    mutations: broadcast::Sender<ConfigMutation>,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self::from_pool(pool))
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        let (mutations, _) = broadcast::channel(MUTATION_CHANNEL_CAPACITY);
        Self { pool, mutations }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Forward trigger notifications into the mutation broadcast.
    ///
    /// Notifications sent while the connection is down are lost, so a
    /// dropped connection or a listener error flushes every cached key.
    pub async fn spawn_change_listener(&self) -> Result<JoinHandle<()>> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(CONFIG_CHANNEL).await?;
        let tx = self.mutations.clone();

        info!(channel = CONFIG_CHANNEL, "Listening for config changes");
        Ok(tokio::spawn(async move {
            loop {
                match listener.try_recv().await {
                    Ok(Some(notification)) => {
                        let mutation = mutation_from_payload(notification.payload());
                        debug!(?mutation, "config change notification");
                        let _ = tx.send(mutation);
                    }
                    Ok(None) => {
                        warn!("Config listener connection lost, flushing cache");
                        let _ = tx.send(ConfigMutation::Flush { symbol: None });
                    }
                    Err(e) => {
                        error!("Config listener error: {}", e);
                        let _ = tx.send(ConfigMutation::Flush { symbol: None });
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        }))
    }

    /// Publish a mutation on the config channel so every listening process
    /// applies it, this one included.
    pub async fn notify(&self, mutation: &ConfigMutation) -> Result<()> {
        let payload = serde_json::to_string(mutation)
            .map_err(|e| QuorumError::Internal(format!("encode notification: {e}")))?;
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(CONFIG_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await?;
        info!(%payload, "config notification published");
        Ok(())
    }

    // ==================== Instruments ====================

    fn instrument_from_row(r: &PgRow) -> InstrumentConfig {
        InstrumentConfig {
            symbol: r.get("symbol"),
            base_currency: r.get("base_currency"),
            quote_currency: r.get("quote_currency"),
            active: r.get("is_active"),
            initial_balance: r.get("initial_balance"),
            trade_size_usd: r.get("trade_size_usd"),
            max_position_percent: r.get("max_position_percent"),
            min_trade_amount: r.get("min_trade_amount"),
            max_trade_amount: r.get("max_trade_amount"),
            price_precision: r.get::<i32, _>("price_precision").max(0) as u32,
            amount_precision: r.get::<i32, _>("amount_precision").max(0) as u32,
        }
    }

    /// Insert or update an instrument row
    #[instrument(skip(self, instrument), fields(symbol = %instrument.symbol))]
    pub async fn upsert_instrument(&self, instrument: &InstrumentConfig) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trading_pairs (symbol, base_currency, quote_currency, is_active,
                initial_balance, trade_size_usd, max_position_percent, min_trade_amount,
                max_trade_amount, price_precision, amount_precision)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (symbol) DO UPDATE SET
                base_currency = EXCLUDED.base_currency,
                quote_currency = EXCLUDED.quote_currency,
                is_active = EXCLUDED.is_active,
                initial_balance = EXCLUDED.initial_balance,
                trade_size_usd = EXCLUDED.trade_size_usd,
                max_position_percent = EXCLUDED.max_position_percent,
                min_trade_amount = EXCLUDED.min_trade_amount,
                max_trade_amount = EXCLUDED.max_trade_amount,
                price_precision = EXCLUDED.price_precision,
                amount_precision = EXCLUDED.amount_precision,
                updated_at = NOW()
            "#,
        )
        .bind(&instrument.symbol)
        .bind(&instrument.base_currency)
        .bind(&instrument.quote_currency)
        .bind(instrument.active)
        .bind(instrument.initial_balance)
        .bind(instrument.trade_size_usd)
        .bind(instrument.max_position_percent)
        .bind(instrument.min_trade_amount)
        .bind(instrument.max_trade_amount)
        .bind(instrument.price_precision as i32)
        .bind(instrument.amount_precision as i32)
        .execute(&self.pool)
        .await?;

        let _ = self.mutations.send(ConfigMutation::Instrument {
            symbol: instrument.symbol.clone(),
        });
        Ok(())
    }

    /// All instruments, active or not, for the validate command
    pub async fn all_instruments(&self) -> Result<Vec<InstrumentConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol, base_currency, quote_currency, is_active, initial_balance,
                   trade_size_usd, max_position_percent, min_trade_amount, max_trade_amount,
                   price_precision, amount_precision
            FROM trading_pairs
            ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(Self::instrument_from_row).collect())
    }

    // ==================== System settings ====================

    pub async fn system_settings(&self) -> Result<Vec<(String, SettingValue)>> {
        let rows = sqlx::query(
            r#"
            SELECT config_key, config_value, config_type
            FROM system_config
            WHERE is_active = true
            ORDER BY config_key
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut settings = Vec::with_capacity(rows.len());
        for r in rows {
            let key: String = r.get("config_key");
            let raw: String = r.get("config_value");
            let kind: String = r.get("config_type");
            match SettingValue::parse(&raw, &kind) {
                Ok(value) => settings.push((key, value)),
                Err(e) => warn!(key = %key, "Skipping system setting: {}", e),
            }
        }
        Ok(settings)
    }
}

#[async_trait]
impl ConfigSource for PostgresStore {
    #[instrument(skip(self))]
    async fn active_instruments(&self) -> Result<Vec<String>> {
        let rows = sqlx::query(
            r#"
            SELECT symbol FROM trading_pairs
            WHERE is_active = true
            ORDER BY symbol
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(|r| r.get("symbol")).collect())
    }

    #[instrument(skip(self))]
    async fn instrument(&self, symbol: &str) -> Result<Option<InstrumentConfig>> {
        let row = sqlx::query(
            r#"
            SELECT symbol, base_currency, quote_currency, is_active, initial_balance,
                   trade_size_usd, max_position_percent, min_trade_amount, max_trade_amount,
                   price_precision, amount_precision
            FROM trading_pairs
            WHERE symbol = $1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(Self::instrument_from_row))
    }

    #[instrument(skip(self))]
    async fn strategies(&self, symbol: &str) -> Result<Vec<StrategyConfig>> {
        let rows = sqlx::query(
            r#"
            SELECT s.strategy_name, psc.is_enabled, psc.weight, psc.parameters
            FROM pair_strategy_config psc
            JOIN strategies s ON psc.strategy_id = s.id
            JOIN trading_pairs tp ON psc.pair_id = tp.id
            WHERE tp.symbol = $1 AND s.is_active = true
            ORDER BY psc.weight DESC, s.strategy_name
            "#,
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| {
                let parameters: serde_json::Value = r.get("parameters");
                let parameters: HashMap<String, serde_json::Value> = match parameters {
                    serde_json::Value::Object(map) => map.into_iter().collect(),
                    _ => HashMap::new(),
                };
                StrategyConfig {
                    strategy_name: r.get("strategy_name"),
                    enabled: r.get("is_enabled"),
                    weight: r.get("weight"),
                    parameters,
                }
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn risk_config(&self, symbol: &str) -> Result<Option<RiskConfig>> {
        let row = sqlx::query(
            r#"
            SELECT prc.stop_loss_percent, prc.take_profit_percent, prc.max_daily_trades,
                   prc.max_daily_loss_percent, prc.trailing_stop_enabled,
                   prc.trailing_stop_percent, prc.max_drawdown_percent,
                   prc.position_sizing_method, prc.sizing_percent, prc.volatility_lookback_days
            FROM pair_risk_config prc
            JOIN trading_pairs tp ON prc.pair_id = tp.id
            WHERE tp.symbol = $1
            "#,
        )
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = row else {
            return Ok(None);
        };

        let method: String = r.get("position_sizing_method");
        let position_sizing_method = PositionSizingMethod::from_str(&method)
            .map_err(|e| QuorumError::Validation(format!("{symbol}: {e}")))?;

        Ok(Some(RiskConfig {
            stop_loss_percent: r.get("stop_loss_percent"),
            take_profit_percent: r.get("take_profit_percent"),
            max_daily_trades: r.get::<i32, _>("max_daily_trades").max(0) as u32,
            max_daily_loss_percent: r.get("max_daily_loss_percent"),
            trailing_stop_enabled: r.get("trailing_stop_enabled"),
            trailing_stop_percent: r.get("trailing_stop_percent"),
            max_drawdown_percent: r.get("max_drawdown_percent"),
            position_sizing_method,
            sizing_percent: r.get("sizing_percent"),
            volatility_lookback_days: r.get::<i32, _>("volatility_lookback_days").max(0) as u32,
        }))
    }

    #[instrument(skip(self, defaults))]
    async fn global_risk_config(&self, defaults: &GlobalRiskConfig) -> Result<GlobalRiskConfig> {
        let settings = self.system_settings().await?;
        let (global, problems) = defaults
            .clone()
            .apply_settings(settings.iter().map(|(k, v)| (k.as_str(), v)));
        for problem in problems {
            warn!("{problem}");
        }
        Ok(global)
    }

    #[instrument(skip(self))]
    async fn set_instrument_active(&self, symbol: &str, active: bool) -> Result<()> {
        let result = sqlx::query(
            "UPDATE trading_pairs SET is_active = $2, updated_at = NOW() WHERE symbol = $1",
        )
        .bind(symbol)
        .bind(active)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuorumError::InstrumentNotFound(symbol.to_string()));
        }
        let _ = self.mutations.send(ConfigMutation::Instrument {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self, update))]
    async fn update_strategy(
        &self,
        symbol: &str,
        strategy: &str,
        update: &StrategyUpdate,
    ) -> Result<()> {
        let existing = self
            .strategies(symbol)
            .await?
            .into_iter()
            .find(|s| s.strategy_name == strategy);
        let merged = update.apply(strategy, existing);
        let parameters = serde_json::to_value(&merged.parameters)?;

        let result = sqlx::query(
            r#"
            INSERT INTO pair_strategy_config (pair_id, strategy_id, is_enabled, weight, parameters)
            SELECT tp.id, s.id, $3, $4, $5
            FROM trading_pairs tp, strategies s
            WHERE tp.symbol = $1 AND s.strategy_name = $2
            ON CONFLICT (pair_id, strategy_id) DO UPDATE SET
                is_enabled = EXCLUDED.is_enabled,
                weight = EXCLUDED.weight,
                parameters = EXCLUDED.parameters,
                updated_at = NOW()
            "#,
        )
        .bind(symbol)
        .bind(strategy)
        .bind(merged.enabled)
        .bind(merged.weight)
        .bind(parameters)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuorumError::Validation(format!(
                "unknown instrument {symbol} or strategy {strategy}"
            )));
        }
        let _ = self.mutations.send(ConfigMutation::Strategy {
            symbol: symbol.to_string(),
            strategy: strategy.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self, update))]
    async fn update_risk(&self, symbol: &str, update: &RiskUpdate) -> Result<()> {
        let merged = update.apply(self.risk_config(symbol).await?);

        let result = sqlx::query(
            r#"
            INSERT INTO pair_risk_config (pair_id, stop_loss_percent, take_profit_percent,
                max_daily_trades, max_daily_loss_percent, trailing_stop_enabled,
                trailing_stop_percent, max_drawdown_percent, position_sizing_method,
                sizing_percent, volatility_lookback_days)
            SELECT tp.id, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11
            FROM trading_pairs tp
            WHERE tp.symbol = $1
            ON CONFLICT (pair_id) DO UPDATE SET
                stop_loss_percent = EXCLUDED.stop_loss_percent,
                take_profit_percent = EXCLUDED.take_profit_percent,
                max_daily_trades = EXCLUDED.max_daily_trades,
                max_daily_loss_percent = EXCLUDED.max_daily_loss_percent,
                trailing_stop_enabled = EXCLUDED.trailing_stop_enabled,
                trailing_stop_percent = EXCLUDED.trailing_stop_percent,
                max_drawdown_percent = EXCLUDED.max_drawdown_percent,
                position_sizing_method = EXCLUDED.position_sizing_method,
                sizing_percent = EXCLUDED.sizing_percent,
                volatility_lookback_days = EXCLUDED.volatility_lookback_days,
                updated_at = NOW()
            "#,
        )
        .bind(symbol)
        .bind(merged.stop_loss_percent)
        .bind(merged.take_profit_percent)
        .bind(merged.max_daily_trades as i32)
        .bind(merged.max_daily_loss_percent)
        .bind(merged.trailing_stop_enabled)
        .bind(merged.trailing_stop_percent)
        .bind(merged.max_drawdown_percent)
        .bind(merged.position_sizing_method.to_string())
        .bind(merged.sizing_percent)
        .bind(merged.volatility_lookback_days as i32)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QuorumError::InstrumentNotFound(symbol.to_string()));
        }
        let _ = self.mutations.send(ConfigMutation::Risk {
            symbol: symbol.to_string(),
        });
        Ok(())
    }

    #[instrument(skip(self, value))]
    async fn set_system_setting(&self, key: &str, value: &SettingValue) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO system_config (config_key, config_value, config_type)
            VALUES ($1, $2, $3)
            ON CONFLICT (config_key) DO UPDATE SET
                config_value = EXCLUDED.config_value,
                config_type = EXCLUDED.config_type,
                is_active = true,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value.to_raw())
        .bind(value.type_name())
        .execute(&self.pool)
        .await?;

        let _ = self.mutations.send(ConfigMutation::Global);
        Ok(())
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<ConfigMutation>> {
        Some(self.mutations.subscribe())
    }
}

// ==================== Fill journal ====================

#[async_trait]
impl FillJournal for PostgresStore {
    #[instrument(skip(self, fill), fields(symbol = %fill.symbol, action = %fill.action))]
    async fn record_fill(&self, fill: &Fill) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trade_fills (id, symbol, action, price, amount, notional,
                realized_pnl, exit_trigger, paper, filled_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(fill.intent_id)
        .bind(&fill.symbol)
        .bind(fill.action.to_string())
        .bind(fill.price)
        .bind(fill.amount)
        .bind(fill.notional)
        .bind(fill.realized_pnl)
        .bind(fill.exit.map(|e| e.to_string()))
        .bind(fill.paper)
        .bind(fill.filled_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fills_on(&self, date: NaiveDate) -> Result<Vec<Fill>> {
        let rows = sqlx::query(
            r#"
            SELECT id, symbol, action, price, amount, notional, realized_pnl,
                   exit_trigger, paper, filled_at
            FROM trade_fills
            WHERE filled_at::date = $1
            ORDER BY filled_at
            "#,
        )
        .bind(date)
        .fetch_all(&self.pool)
        .await?;

        let mut fills = Vec::with_capacity(rows.len());
        for r in rows {
            let action: String = r.get("action");
            let Ok(action) = Action::from_str(&action) else {
                warn!(action = %action, "Skipping fill with unknown action");
                continue;
            };
            let exit = r
                .get::<Option<String>, _>("exit_trigger")
                .and_then(|s| parse_exit(&s));
            fills.push(Fill {
                intent_id: r.get("id"),
                symbol: r.get("symbol"),
                action,
                price: r.get::<Decimal, _>("price"),
                amount: r.get("amount"),
                notional: r.get("notional"),
                realized_pnl: r.get("realized_pnl"),
                exit,
                paper: r.get("paper"),
                filled_at: r.get::<DateTime<Utc>, _>("filled_at"),
            });
        }
        Ok(fills)
    }
}

/// Decode a trigger payload. Anything unreadable may have touched any key,
/// so it becomes a full flush.
fn mutation_from_payload(payload: &str) -> ConfigMutation {
    serde_json::from_str(payload).unwrap_or_else(|e| {
        warn!(payload, "Unparseable config notification ({}), flushing cache", e);
        ConfigMutation::Flush { symbol: None }
    })
}

fn parse_exit(raw: &str) -> Option<ExitTrigger> {
    match raw {
        "STOP_LOSS" => Some(ExitTrigger::StopLoss),
        "TAKE_PROFIT" => Some(ExitTrigger::TakeProfit),
        "TRAILING_STOP" => Some(ExitTrigger::TrailingStop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_payloads_decode() {
        assert_eq!(
            mutation_from_payload(r#"{"kind":"risk","symbol":"BTC/USDT"}"#),
            ConfigMutation::Risk {
                symbol: "BTC/USDT".to_string()
            }
        );
        assert_eq!(
            mutation_from_payload(r#"{"kind":"strategy","symbol":"BTC/USDT","strategy":"rsi"}"#),
            ConfigMutation::Strategy {
                symbol: "BTC/USDT".to_string(),
                strategy: "rsi".to_string()
            }
        );
        assert_eq!(mutation_from_payload(r#"{"kind":"global"}"#), ConfigMutation::Global);
    }

    #[test]
    fn test_unreadable_payload_flushes_everything() {
        for payload in ["", "not json", r#"{"kind":"pair"}"#, r#"{"kind":"risk"}"#] {
            assert_eq!(
                mutation_from_payload(payload),
                ConfigMutation::Flush { symbol: None },
                "payload {payload:?}"
            );
        }
    }

    #[test]
    fn test_flush_notification_round_trips() {
        let mutation = ConfigMutation::Flush {
            symbol: Some("ETH/USDT".to_string()),
        };
        let payload = serde_json::to_string(&mutation).unwrap();
        assert_eq!(mutation_from_payload(&payload), mutation);
    }
}
