use chrono::Utc;
use quorum::cache::{CacheStore, ConfigService};
use quorum::domain::{
    Action, GlobalRiskConfig, InstrumentConfig, RiskConfig, RiskReason, SettingValue,
    StrategyConfig, Verdict,
};
use quorum::pipeline::{
    DecisionPipeline, Fill, MarketDataSource, PaperExecutor, PaperLedger, Scheduler,
    StaticMarketData, TradeHistory,
};
use quorum::source::{ConfigSource, InMemoryConfigSource, StrategyUpdate};
use quorum::strategy::IndicatorSnapshot;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use uuid::Uuid;

const BTC: &str = "BTC/USDT";

struct Engine {
    source: Arc<InMemoryConfigSource>,
    config: Arc<ConfigService>,
    market: Arc<StaticMarketData>,
    ledger: PaperLedger,
    pipeline: Arc<DecisionPipeline>,
}

async fn engine_with_ttl(ttl: Duration) -> Engine {
    let source = Arc::new(InMemoryConfigSource::new());
    source
        .upsert_instrument(
            InstrumentConfig::with_defaults(BTC),
            vec![
                StrategyConfig::new("sma_crossover", dec!(0.6)),
                StrategyConfig::new("rsi", dec!(0.4)),
            ],
            Some(RiskConfig {
                max_daily_trades: 5,
                ..RiskConfig::default()
            }),
        )
        .await;

    let config = Arc::new(ConfigService::new(
        Arc::new(CacheStore::new(ttl)),
        Arc::clone(&source) as Arc<dyn ConfigSource>,
        Duration::from_millis(200),
        GlobalRiskConfig::default(),
    ));
    let market = Arc::new(StaticMarketData::new());
    let ledger = PaperLedger::new(dec!(10000));
    let pipeline = DecisionPipeline::new(
        Arc::clone(&config),
        Arc::clone(&market) as Arc<dyn MarketDataSource>,
        Arc::new(ledger.clone()),
        Arc::new(PaperExecutor::new(ledger.clone())),
        Decimal::ZERO,
    );
    Engine {
        source,
        config,
        market,
        ledger,
        pipeline: Arc::new(pipeline),
    }
}

async fn engine() -> Engine {
    engine_with_ttl(Duration::from_secs(300)).await
}

/// Golden cross (sma_crossover BUY) while RSI is overbought and falling (rsi SELL)
fn split_vote(price: Decimal) -> IndicatorSnapshot {
    IndicatorSnapshot::new(BTC, price)
        .with_sma((99.0, 100.0), (101.0, 100.0))
        .with_rsi(75.0, -1.5)
}

fn fill_today(pnl: Decimal) -> Fill {
    Fill {
        intent_id: Uuid::new_v4(),
        symbol: BTC.to_string(),
        action: Action::Buy,
        price: dec!(100),
        amount: dec!(0.1),
        notional: dec!(10),
        realized_pnl: pnl,
        exit: None,
        paper: true,
        filled_at: Utc::now(),
    }
}

#[tokio::test]
async fn weighted_majority_buy_is_approved_and_filled() {
    let e = engine().await;
    e.market.set(split_vote(dec!(100))).await;

    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.decision.action, Action::Buy);
    assert_eq!(outcome.decision.score, dec!(0.2));
    assert_eq!(outcome.intent.verdict, Verdict::Approved);
    assert_eq!(outcome.intent.action, Action::Buy);
    assert!(outcome.intent.amount > Decimal::ZERO);
    assert!(outcome.executed());

    let position = e.ledger.open_position(BTC).await.unwrap().unwrap();
    assert_eq!(position.amount, outcome.intent.amount);
}

#[tokio::test]
async fn buy_with_neutral_partner_scores_its_own_weight() {
    let e = engine().await;
    // Golden cross for sma_crossover, RSI mid-range so rsi holds
    e.market
        .set(
            IndicatorSnapshot::new(BTC, dec!(100))
                .with_sma((99.0, 100.0), (101.0, 100.0))
                .with_rsi(50.0, 0.0),
        )
        .await;

    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    let rsi_vote = outcome
        .decision
        .votes
        .iter()
        .find(|cv| cv.vote.strategy == "rsi")
        .unwrap();
    assert_eq!(rsi_vote.vote.action, Action::Hold);
    assert_eq!(outcome.decision.score, dec!(0.6));
    assert_eq!(outcome.decision.action, Action::Buy);
    assert_eq!(outcome.intent.verdict, Verdict::Approved);
    assert_eq!(outcome.intent.action, Action::Buy);
    assert!(outcome.executed());
}

#[tokio::test]
async fn fifth_trade_of_the_day_hits_the_daily_limit() {
    let e = engine().await;
    let fills: Vec<Fill> = (0..5).map(|_| fill_today(Decimal::ZERO)).collect();
    e.ledger.replay(&fills).await;
    e.market.set(split_vote(dec!(100))).await;

    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.decision.action, Action::Buy);
    assert_eq!(outcome.intent.verdict, Verdict::Rejected);
    assert_eq!(outcome.intent.reason, Some(RiskReason::DailyTradeLimit));
    assert!(!outcome.executed());
}

#[tokio::test]
async fn cold_cache_with_source_down_skips_the_cycle() {
    let e = engine().await;
    e.market.set(split_vote(dec!(100))).await;
    e.source.set_unavailable(true);

    let err = e.pipeline.run_cycle(BTC).await.unwrap_err();
    assert!(err.is_config_unavailable());
    assert!(e.pipeline.audit().is_empty().await);
    assert_eq!(e.ledger.cash().await, dec!(10000));
}

#[tokio::test]
async fn warm_cache_survives_a_source_outage_until_expiry() {
    let e = engine_with_ttl(Duration::from_millis(150)).await;
    e.market
        .set(IndicatorSnapshot::new(BTC, dec!(100)).with_rsi(50.0, 0.0))
        .await;

    e.pipeline.run_cycle(BTC).await.unwrap();
    e.source.set_unavailable(true);
    assert!(e.pipeline.run_cycle(BTC).await.is_ok());

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(e.pipeline.run_cycle(BTC).await.is_err());
}

#[tokio::test]
async fn weight_change_is_visible_on_the_next_cycle() {
    let e = engine().await;
    e.market.set(split_vote(dec!(100))).await;
    assert_eq!(
        e.pipeline.run_cycle(BTC).await.unwrap().decision.action,
        Action::Buy
    );

    e.config
        .update_strategy(
            BTC,
            "rsi",
            &StrategyUpdate {
                weight: Some(dec!(0.9)),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // 0.6 BUY vs 0.9 SELL, normalised: (0.6 - 0.9) / 1.5 = -0.2
    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.decision.action, Action::Sell);
    assert_eq!(outcome.decision.score, dec!(-0.2));
}

#[tokio::test]
async fn drawdown_trips_the_latch_until_manual_reset() {
    let e = engine().await;
    e.config
        .set_system_setting(
            "emergency_stop_threshold_percent",
            &SettingValue::Float(dec!(0.5)),
        )
        .await
        .unwrap();

    let oversold = |price| IndicatorSnapshot::new(BTC, price).with_rsi(20.0, 1.0);
    e.market.set(oversold(dec!(100))).await;
    assert!(e.pipeline.run_cycle(BTC).await.unwrap().executed());

    // Position marked down far enough to cross the threshold
    e.market.set(oversold(dec!(50))).await;
    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.intent.reason, Some(RiskReason::EmergencyStop));
    assert!(e.pipeline.emergency_stop().is_active());

    // Latched: even after the threshold is relaxed
    e.config
        .set_system_setting(
            "emergency_stop_threshold_percent",
            &SettingValue::Float(dec!(50)),
        )
        .await
        .unwrap();
    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.intent.verdict, Verdict::Rejected);

    assert!(e.pipeline.emergency_stop().reset("ops").await);
    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.intent.verdict, Verdict::Approved);
}

#[tokio::test]
async fn scheduler_isolates_a_misconfigured_instrument() {
    let e = engine().await;
    e.source
        .upsert_instrument(
            InstrumentConfig::with_defaults("ETH/USDT"),
            vec![StrategyConfig::new("rsi", dec!(1))],
            None,
        )
        .await;
    e.market.set(split_vote(dec!(100))).await;
    e.market
        .set(IndicatorSnapshot::new("ETH/USDT", dec!(3000)).with_rsi(20.0, 1.0))
        .await;

    let scheduler = Scheduler::new(Arc::clone(&e.pipeline), Duration::from_secs(60), 4);
    let summary = scheduler.run_once().await.unwrap();
    assert_eq!(summary.instruments, 2);
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.panicked, 0);

    let audited = e.pipeline.audit().recent(10, None).await;
    assert_eq!(audited.len(), 1);
    assert_eq!(audited[0].symbol, BTC);
}

#[tokio::test]
async fn invalidation_listener_applies_source_mutations() {
    let e = engine().await;
    let (tx, rx) = watch::channel(false);
    let handle = e.config.spawn_invalidation_listener(rx).unwrap();

    e.market.set(split_vote(dec!(100))).await;
    e.pipeline.run_cycle(BTC).await.unwrap();

    // Written behind the service's back, announced only on the feed
    e.source
        .update_strategy(BTC, "sma_crossover", &StrategyUpdate {
            enabled: Some(false),
            ..Default::default()
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let outcome = e.pipeline.run_cycle(BTC).await.unwrap();
    assert_eq!(outcome.decision.action, Action::Sell);

    tx.send(true).unwrap();
    handle.await.unwrap();
}
