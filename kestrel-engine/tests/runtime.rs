//! End-to-end runtime behaviour against the in-memory venue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use kestrel_core::{Interval, Side};
use kestrel_engine::{
    AgentRuntime, CompositeOp, Condition, EngineConfig, LogStatusSink, PriceCondition,
    RuntimeEvent, SafetyLimits, StatusForwarder, TechnicalCondition, TechnicalShape,
    TriggerCallback, TriggerFire, TriggerKind, TriggerSpec, ValueCondition,
};
use kestrel_execution::{ExecutorConfig, OrderExecutor};
use kestrel_indicators::{FieldSelector, IndicatorSpec};
use kestrel_ledger::{CloseStatus, LedgerConfig, PositionLedger};
use kestrel_test_utils::{candles_from_closes, flat_snapshot, MockVenue};
use kestrel_venue::{ClearinghouseSnapshot, CoinMeta, FeeSchedule, ProtectionKind};

fn fast_config() -> EngineConfig {
    EngineConfig {
        eval_min_sleep: Duration::from_millis(10),
        eval_max_sleep: Duration::from_millis(50),
        technical_min_interval: Duration::ZERO,
        min_candles: 15,
        lookback_multiplier: 3,
        mid_staleness: Duration::ZERO,
        reconcile_interval: Duration::from_secs(3600),
        fee_refresh_interval: Duration::from_secs(3600),
    }
}

fn build_runtime(venue: &Arc<MockVenue>, safety: SafetyLimits) -> AgentRuntime {
    let executor = Arc::new(OrderExecutor::new(
        venue.clone(),
        venue.clone(),
        Uuid::new_v4(),
        ExecutorConfig::default(),
    ));
    let (status, _task) = StatusForwarder::spawn(Arc::new(LogStatusSink), 64);
    AgentRuntime::new(
        fast_config(),
        executor,
        venue.clone(),
        venue.clone(),
        PositionLedger::new(LedgerConfig::default()),
        safety,
        status,
    )
}

fn capture_callback() -> (TriggerCallback, mpsc::UnboundedReceiver<TriggerFire>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let callback: TriggerCallback = Arc::new(move |fire| {
        let tx = tx.clone();
        Box::pin(async move {
            let _ = tx.send(fire);
            Ok(())
        })
    });
    (callback, rx)
}

fn btc_meta() -> CoinMeta {
    CoinMeta {
        coin: "BTC".to_string(),
        size_decimals: 4,
        max_leverage: 50,
    }
}

#[tokio::test(start_paused = true)]
async fn price_trigger_fires_on_crossing_and_rearms() {
    let venue = Arc::new(MockVenue::new());
    venue.set_mid("BTC", dec!(49000));

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    runtime
        .add_trigger(TriggerSpec {
            name: "btc-breakout".into(),
            kind: TriggerKind::Single(Condition::Price(PriceCondition {
                coin: "BTC".into(),
                condition: ValueCondition::Above(dec!(50000)),
            })),
            one_shot: false,
            callback,
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    // Arm below the level first.
    tokio::time::sleep(Duration::from_millis(200)).await;
    venue.set_mid("BTC", dec!(50500));
    let fire = timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("trigger should fire")
        .unwrap();
    assert_eq!(fire.name, "btc-breakout");
    assert_eq!(fire.observed, Some(dec!(50500)));

    // Holding above the level must not fire again.
    assert!(timeout(Duration::from_secs(2), fires.recv()).await.is_err());

    // Dropping back below re-arms for a second crossing.
    venue.set_mid("BTC", dec!(49500));
    tokio::time::sleep(Duration::from_millis(200)).await;
    venue.set_mid("BTC", dec!(50100));
    timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("re-armed trigger should fire")
        .unwrap();

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn steady_event_flow_does_not_starve_evaluation() {
    let venue = Arc::new(MockVenue::new());
    venue.set_mid("BTC", dec!(49000));

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    runtime
        .add_trigger(TriggerSpec {
            name: "busy-feed".into(),
            kind: TriggerKind::Single(Condition::Price(PriceCondition {
                coin: "BTC".into(),
                condition: ValueCondition::Above(dec!(50000)),
            })),
            one_shot: false,
            callback,
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    // Arm below the level first.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Mid updates arriving faster than the evaluation sleep must not
    // push the next evaluation back.
    venue.set_mid("BTC", dec!(50500));
    let flood_handle = handle.clone();
    let flood = tokio::spawn(async move {
        loop {
            flood_handle.send(RuntimeEvent::Mids(HashMap::from([(
                "BTC".to_string(),
                dec!(50500),
            )])));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let fire = timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("evaluation must keep its cadence under event load")
        .unwrap();
    assert_eq!(fire.observed, Some(dec!(50500)));

    flood.abort();
    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn liquidation_event_force_closes_local_position() {
    let venue = Arc::new(MockVenue::new());
    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    runtime.ledger_mut().open_or_add(
        "BTC",
        Side::Buy,
        dec!(1),
        dec!(50000),
        Decimal::ZERO,
        Utc::now(),
    );
    runtime.ledger_mut().register_protection(
        "BTC",
        ProtectionKind::StopLoss,
        Some(4242),
        None,
    );
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    handle.send(RuntimeEvent::Liquidation {
        coin: "BTC".into(),
        size: dec!(1),
        price: dec!(45000),
    });
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown();
    let runtime = task.await.unwrap();

    assert!(runtime.ledger().position("BTC").is_none());
    assert!(runtime.ledger().protections("BTC").is_empty());
    let closed: Vec<_> = runtime.ledger().closed_history().collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].status, CloseStatus::Liquidated);
    assert_eq!(closed[0].exit_price, dec!(45000));
    assert!(closed[0].estimated);
}

#[tokio::test(start_paused = true)]
async fn one_shot_trigger_never_fires_twice() {
    let venue = Arc::new(MockVenue::new());
    venue.set_mid("BTC", dec!(49000));

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    runtime
        .add_trigger(TriggerSpec {
            name: "once".into(),
            kind: TriggerKind::Single(Condition::Price(PriceCondition {
                coin: "BTC".into(),
                condition: ValueCondition::Above(dec!(50000)),
            })),
            one_shot: true,
            // Keep a local handle on the callback so the capture channel
            // stays open after the runtime retires the one-shot trigger.
            callback: Arc::clone(&callback),
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    tokio::time::sleep(Duration::from_millis(200)).await;
    venue.set_mid("BTC", dec!(51000));
    timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("one-shot should fire")
        .unwrap();

    // A fresh crossing after retirement goes nowhere.
    venue.set_mid("BTC", dec!(49000));
    tokio::time::sleep(Duration::from_millis(200)).await;
    venue.set_mid("BTC", dec!(52000));
    assert!(timeout(Duration::from_secs(2), fires.recv()).await.is_err());

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn composite_all_waits_for_every_leg() {
    let venue = Arc::new(MockVenue::new());
    venue.set_mid("BTC", dec!(51000));
    venue.set_mid("ETH", dec!(2900));

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    let leg = |coin: &str, level| {
        Condition::Price(PriceCondition {
            coin: coin.into(),
            condition: ValueCondition::Above(level),
        })
    };
    runtime
        .add_trigger(TriggerSpec {
            name: "both-up".into(),
            kind: TriggerKind::Composite {
                operator: CompositeOp::All,
                legs: vec![leg("BTC", dec!(50000)), leg("ETH", dec!(3000))],
            },
            one_shot: false,
            callback,
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    // BTC alone satisfied: combined stays false.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(timeout(Duration::from_secs(1), fires.recv()).await.is_err());

    venue.set_mid("ETH", dec!(3100));
    timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("composite should fire once both legs hold")
        .unwrap();

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn composite_rejects_single_leg() {
    let venue = Arc::new(MockVenue::new());
    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, _fires) = capture_callback();
    let err = runtime
        .add_trigger(TriggerSpec {
            name: "degenerate".into(),
            kind: TriggerKind::Composite {
                operator: CompositeOp::Any,
                legs: vec![Condition::Price(PriceCondition {
                    coin: "BTC".into(),
                    condition: ValueCondition::Above(dec!(1)),
                })],
            },
            one_shot: false,
            callback,
        })
        .unwrap_err();
    assert!(err.to_string().contains("at least two legs"));
}

#[tokio::test(start_paused = true)]
async fn technical_trigger_fires_when_rsi_crosses() {
    let venue = Arc::new(MockVenue::new());
    // Declining closes: RSI pinned low.
    let falling: Vec<Decimal> = (0..30).map(|i| Decimal::from(200 - i)).collect();
    venue.set_candles(
        "BTC",
        Interval::OneHour,
        candles_from_closes("BTC", Interval::OneHour, &falling),
    );

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    runtime
        .add_trigger(TriggerSpec {
            name: "rsi-overbought".into(),
            kind: TriggerKind::Single(Condition::Technical(TechnicalCondition {
                coin: "BTC".into(),
                interval: Interval::OneHour,
                shape: TechnicalShape::Level {
                    indicator: IndicatorSpec::default_rsi(),
                    field: FieldSelector::Primary,
                    condition: ValueCondition::Above(dec!(70)),
                },
            })),
            one_shot: false,
            callback,
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    // Arm while the market falls.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(timeout(Duration::from_secs(1), fires.recv()).await.is_err());

    // Rally: RSI pins high and the trigger edges.
    let rising: Vec<Decimal> = (0..30).map(|i| Decimal::from(200 + i)).collect();
    venue.set_candles(
        "BTC",
        Interval::OneHour,
        candles_from_closes("BTC", Interval::OneHour, &rising),
    );
    let fire = timeout(Duration::from_secs(10), fires.recv())
        .await
        .expect("technical trigger should fire")
        .unwrap();
    assert!(fire.observed.unwrap() > dec!(70));

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn crossover_fires_when_fast_average_overtakes_slow() {
    let venue = Arc::new(MockVenue::new());
    let falling: Vec<Decimal> = (0..30).map(|i| Decimal::from(200 - i)).collect();
    venue.set_candles(
        "ETH",
        Interval::FifteenMinutes,
        candles_from_closes("ETH", Interval::FifteenMinutes, &falling),
    );

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    runtime
        .add_trigger(TriggerSpec {
            name: "golden-cross".into(),
            kind: TriggerKind::Single(Condition::Technical(TechnicalCondition {
                coin: "ETH".into(),
                interval: Interval::FifteenMinutes,
                shape: TechnicalShape::Crossover {
                    fast: IndicatorSpec::Sma { period: 3 },
                    slow: IndicatorSpec::Sma { period: 10 },
                },
            })),
            one_shot: false,
            callback,
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    // Downtrend: fast average sits below the slow one.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(timeout(Duration::from_secs(1), fires.recv()).await.is_err());

    let rising: Vec<Decimal> = (0..30).map(|i| Decimal::from(200 + i)).collect();
    venue.set_candles(
        "ETH",
        Interval::FifteenMinutes,
        candles_from_closes("ETH", Interval::FifteenMinutes, &rising),
    );
    let fire = timeout(Duration::from_secs(10), fires.recv())
        .await
        .expect("crossover should fire when the difference turns positive")
        .unwrap();
    assert!(fire.observed.unwrap() > Decimal::ZERO);

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scheduled_trigger_respects_pause() {
    let venue = Arc::new(MockVenue::new());
    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let (callback, mut fires) = capture_callback();
    runtime
        .add_trigger(TriggerSpec {
            name: "heartbeat".into(),
            kind: TriggerKind::Scheduled {
                every: Duration::from_millis(100),
            },
            one_shot: false,
            callback,
        })
        .unwrap();
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("scheduled trigger should fire")
        .unwrap();

    handle.pause();
    // Let fires queued before the pause drain out, then discard them.
    tokio::time::sleep(Duration::from_millis(300)).await;
    while fires.try_recv().is_ok() {}
    assert!(
        timeout(Duration::from_millis(500), fires.recv()).await.is_err(),
        "paused agent must hold scheduled fires"
    );

    handle.resume();
    timeout(Duration::from_secs(5), fires.recv())
        .await
        .expect("resumed trigger should fire again")
        .unwrap();

    handle.shutdown();
    task.await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn user_fill_closes_protected_position() {
    let venue = Arc::new(MockVenue::new());
    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    runtime.ledger_mut().open_or_add(
        "BTC",
        Side::Buy,
        dec!(0.5),
        dec!(50000),
        dec!(11.25),
        Utc::now(),
    );
    runtime.ledger_mut().register_protection(
        "BTC",
        ProtectionKind::StopLoss,
        Some(9001),
        None,
    );
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    handle.send(RuntimeEvent::UserFill(kestrel_core::Fill {
        coin: "BTC".into(),
        side: Side::Sell,
        price: dec!(48000),
        size: dec!(0.5),
        fee: dec!(10.8),
        closed_pnl: Some(dec!(-1000)),
        order_id: 9001,
        correlation_id: None,
        timestamp: Utc::now(),
    }));
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown();
    let runtime = task.await.unwrap();

    assert!(runtime.ledger().position("BTC").is_none());
    let closed: Vec<_> = runtime.ledger().closed_history().collect();
    assert_eq!(closed.len(), 1);
    assert_eq!(closed[0].status, CloseStatus::StopLoss);
    assert_eq!(closed[0].exit_price, dec!(48000));
}

#[tokio::test(start_paused = true)]
async fn reconcile_force_closes_position_missing_on_venue() {
    let venue = Arc::new(MockVenue::new());
    venue.set_snapshot(flat_snapshot(dec!(10000)));
    venue.set_mid("BTC", dec!(51000));

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    runtime.ledger_mut().open_or_add(
        "BTC",
        Side::Buy,
        dec!(1),
        dec!(50000),
        Decimal::ZERO,
        Utc::now(),
    );
    let handle = runtime.handle();
    let task = tokio::spawn(runtime.run());

    handle.send(RuntimeEvent::Reconcile);
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown();
    let runtime = task.await.unwrap();

    assert!(runtime.ledger().position("BTC").is_none());
    let closed: Vec<_> = runtime.ledger().closed_history().collect();
    assert_eq!(closed[0].status, CloseStatus::ClosedExternal);
    assert!(closed[0].estimated);
}

#[tokio::test]
async fn guarded_entry_blocked_by_size_limit_never_reaches_venue() {
    let venue = Arc::new(MockVenue::new());
    let mut runtime = build_runtime(
        &venue,
        SafetyLimits {
            max_position_size: dec!(1),
            daily_loss_limit: Decimal::ZERO,
        },
    );

    let result = runtime.guarded_market_entry("BTC", Side::Buy, dec!(2)).await;
    assert!(!result.success);
    assert!(result.error.unwrap().contains("per-order limit"));
    assert!(venue.placed_orders().is_empty());
}

#[tokio::test]
async fn guarded_entry_records_the_fill_in_the_ledger() {
    let venue = Arc::new(MockVenue::new());
    venue.set_meta(btc_meta());
    venue.set_mid("BTC", dec!(50000));
    venue.set_fees(FeeSchedule {
        taker_rate: Decimal::ZERO,
        maker_rate: Decimal::ZERO,
    });
    venue.set_snapshot(ClearinghouseSnapshot {
        positions: Vec::new(),
        account_value: dec!(100000),
        available_balance: dec!(100000),
        total_margin_used: Decimal::ZERO,
        timestamp: Utc::now(),
    });

    let mut runtime = build_runtime(&venue, SafetyLimits::default());
    let result = runtime.guarded_market_entry("BTC", Side::Buy, dec!(0.5)).await;
    assert!(result.success);

    let position = runtime.ledger().position("BTC").expect("position recorded");
    assert_eq!(position.size, dec!(0.5));
    // Filled at the slippage-bounded limit the mock echoes back.
    assert_eq!(position.entry_price, dec!(52500));
}
