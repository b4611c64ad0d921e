//! Scanning and the execution gate, end to end.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::time::Duration;

use helix::broker::{CloseOutcome, OrderGateway};
use helix::clock::Clock;
use helix::engine::events::EngineEvent;
use helix::market::ArbDirection;
use helix::types::{CloseReason, Direction, EngineError, TriangleState};

use crate::support::{config, Harness, TRIANGLE};

#[tokio::test]
async fn test_dislocation_opens_layer_zero() {
    let mut h = Harness::new(config());
    let report = h.tick().await;

    assert_eq!(report.scanned, 1);
    assert_eq!(report.ready, 1);
    assert_eq!(report.opened.len(), 1);

    let snapshot = h.engine.snapshot();
    let opp = &snapshot.opportunities[0];
    assert_eq!(opp.triangle_id, TRIANGLE);
    assert_eq!(opp.direction, ArbDirection::Forward);
    assert_eq!(opp.net_pips, dec!(18.5));
    assert!(opp.ready);

    let t = h.live();
    assert_eq!(t.state, TriangleState::Open);
    assert_eq!(t.recovery_layers(), 0);
    let mut legs: Vec<(String, Direction, Decimal)> = t.legs().map(|l| (l.symbol.clone(), l.direction, l.volume)).collect();
    legs.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        legs,
        vec![
            ("EURJPY".to_string(), Direction::Buy, dec!(0.1)),
            ("EURUSD".to_string(), Direction::Sell, dec!(0.1)),
            ("USDJPY".to_string(), Direction::Sell, dec!(0.1)),
        ]
    );
    assert_eq!(h.broker.open_positions().len(), 3);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::TriangleOpened { .. })), 1);
    assert_eq!(snapshot.triangles.len(), 1);
    assert_eq!(snapshot.open_lots, dec!(0.3));
}

#[tokio::test]
async fn test_unchanged_quotes_are_idempotent() {
    let mut h = Harness::new(config());
    h.tick().await;
    h.tick().await;

    let submitted = h.broker.submissions().len();
    let transitions = h.live().transitions.len();
    let profit = h.live().aggregate_profit;

    for _ in 0..3 {
        let report = h.tick().await;
        assert!(report.opened.is_empty());
        assert!(!report.is_eventful());
    }
    assert_eq!(h.broker.submissions().len(), submitted);
    assert_eq!(h.live().transitions.len(), transitions);
    assert_eq!(h.live().aggregate_profit, profit);
    assert!(h.broker.closes().is_empty());
}

#[tokio::test]
async fn test_rejected_leg_reverses_the_unit() {
    let mut h = Harness::new(config());
    h.broker.reject_orders_for("USDJPY");
    let report = h.tick().await;

    assert!(report.opened.is_empty());
    assert!(matches!(
        report.gate_failures[0].1,
        EngineError::ExecutionIncomplete { filled: 2, required: 3, .. }
    ));
    assert!(h.engine.registry().is_empty());
    assert!(h.broker.open_positions().is_empty());
    assert_eq!(h.engine.risk().open_lots(), Decimal::ZERO);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::ExecutionFailed { .. })), 1);

    // the next tick is a fresh attempt
    h.broker.clear_faults();
    let report = h.tick().await;
    assert_eq!(report.opened.len(), 1);
    assert_eq!(h.broker.open_positions().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fill_timeout_is_a_hard_cancellation_point() {
    let mut h = Harness::new(config());
    h.broker.slow_fills_for("EURJPY", Duration::from_secs(5));
    let report = h.tick().await;

    let (_, err) = &report.gate_failures[0];
    match err {
        EngineError::ExecutionIncomplete { filled, reason, .. } => {
            assert_eq!(*filled, 2);
            assert!(reason.contains("Broker timeout on EURJPY"));
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(h.engine.registry().is_empty());
    assert!(h.broker.open_positions().is_empty());
}

#[tokio::test]
async fn test_margin_shortfall_blocks_entry() {
    let mut cfg = config();
    cfg.risk.margin_per_lot = dec!(50000);
    let mut h = Harness::new(cfg);
    let report = h.tick().await;

    assert!(matches!(report.gate_failures[0].1, EngineError::MarginInsufficient { .. }));
    assert!(h.broker.submissions().is_empty());
    assert!(h.engine.registry().is_empty());
}

#[tokio::test]
async fn test_stale_quote_skips_scan_and_instance() {
    let mut h = Harness::new(config());
    h.open_forward().await;
    h.tick().await;
    let before = h.live().aggregate_profit;

    h.flat("EURUSD", dec!(1.2600));
    h.broker.remove_quote("EURJPY");
    let report = h.tick().await;

    assert_eq!(report.skipped_triangles, 1);
    assert_eq!(report.stale_instances, 1);
    assert_eq!(h.live().aggregate_profit, before);
    assert_eq!(h.engine.snapshot().stale_symbols, vec!["EURJPY".to_string()]);

    // a quote older than the staleness window counts as missing
    h.advance(10);
    h.flat("EURUSD", dec!(1.2600));
    h.flat("USDJPY", dec!(129.99875));
    h.broker.set_quote("EURJPY", dec!(162.30), dec!(162.30), h.clock.now() - chrono::Duration::seconds(5));
    let report = h.tick().await;
    assert_eq!(report.stale_instances, 1);
    assert_eq!(h.live().aggregate_profit, before);
}

#[tokio::test]
async fn test_disconnect_suspends_orders_but_keeps_marking() {
    let mut h = Harness::new(config());
    h.open_forward().await;

    h.broker.set_connected(false);
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    let report = h.tick().await;

    assert!(report.suspended);
    assert!(report.recoveries.is_empty());
    assert_eq!(h.live().aggregate_pips, dec!(-29));
    assert_eq!(h.live().recovery_layers(), 0);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::BrokerDisconnected)), 1);

    h.advance(1);
    h.tick().await;
    assert_eq!(h.count(|e| matches!(e, EngineEvent::BrokerDisconnected)), 1);

    h.broker.set_connected(true);
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(h.count(|e| matches!(e, EngineEvent::BrokerReconnected)), 1);
    assert_eq!(report.recoveries.len(), 1);
}

#[tokio::test]
async fn test_manual_close() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;
    h.flat("EURJPY", dec!(162.35));
    h.tick().await;

    h.engine.close_triangle(&id).await.unwrap();
    assert!(h.engine.registry().is_empty());
    assert!(h.broker.open_positions().is_empty());

    let closed = h.engine.registry().history().next().unwrap();
    assert_eq!(closed.id, id);
    assert_eq!(closed.state, TriangleState::Closed);
    assert_eq!(closed.close_reason, Some(CloseReason::Manual));
    assert_eq!(closed.realized_profit, dec!(5));
    assert!(!h.engine.risk().is_open(TRIANGLE));

    let err = h.engine.close_triangle("nope").await.unwrap_err();
    assert_eq!(err, EngineError::TriangleNotFound("nope".into()));
}

#[tokio::test]
async fn test_snapshot_published_every_tick() {
    let mut h = Harness::new(config());
    let mut rx = h.engine.subscribe();

    h.tick().await;
    assert!(rx.has_changed().unwrap());
    let snapshot = rx.borrow_and_update().clone();
    assert_eq!(snapshot.tick, 1);
    assert!(snapshot.broker_connected);
    assert_eq!(snapshot.account.unwrap().balance, dec!(10000));
    assert_eq!(snapshot.correlations.len(), 1);

    h.tick().await;
    assert_eq!(rx.borrow_and_update().tick, 2);
}

#[tokio::test(start_paused = true)]
async fn test_run_ticks_until_shutdown() {
    let mut h = Harness::new(config());
    h.engine
        .run(async {
            tokio::time::sleep(Duration::from_millis(1_100)).await;
        })
        .await;
    assert!(h.engine.snapshot().tick >= 4);
    assert_eq!(h.engine.registry().len(), 1);
}

#[tokio::test]
async fn test_unreversed_leg_swept_before_reentry() {
    let mut h = Harness::new(config());
    h.broker.reject_orders_for("USDJPY");
    h.broker.reject_closes_for("EURUSD");
    let report = h.tick().await;

    assert!(report.opened.is_empty());
    assert_eq!(h.count(|e| matches!(e, EngineEvent::OrphanedPosition { .. })), 1);
    let broker_volume: Decimal = h.broker.open_positions().iter().map(|p| p.volume).sum();
    assert_eq!(broker_volume, dec!(0.1));
    assert_eq!(h.engine.risk().open_lots(), broker_volume);
    let snapshot = h.engine.snapshot();
    assert_eq!(snapshot.orphans.len(), 1);
    assert_eq!(snapshot.orphans[0].symbol, "EURUSD");

    // the orphan cannot be closed yet and blocks its definition
    let submitted = h.broker.submissions().len();
    h.advance(1);
    let report = h.tick().await;
    assert!(report.orphans_closed.is_empty());
    assert!(report.opened.is_empty());
    assert_eq!(h.broker.submissions().len(), submitted);

    h.broker.clear_faults();
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.orphans_closed.len(), 1);
    // sold at 1.2499875, bought back at 1.2500125
    assert_eq!(
        h.count(|e| matches!(e, EngineEvent::OrphanClosed { realized, .. } if *realized == dec!(-0.25))),
        1
    );
    assert!(h.engine.risk().orphans().is_empty());
    // swept before the gate runs: the entry goes ahead on the same tick
    assert_eq!(report.opened.len(), 1);
    assert_eq!(h.engine.risk().open_lots(), dec!(0.3));
}

#[tokio::test]
async fn test_legs_closed_at_broker_are_reconciled() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;
    h.block_entries();

    let eurjpy = h.live().legs().find(|l| l.symbol == "EURJPY").unwrap().id.clone();
    let outcome = h.broker.close(&eurjpy, Decimal::ONE).await;
    assert!(matches!(outcome, CloseOutcome::Closed { .. }));

    h.advance(1);
    let report = h.tick().await;
    assert!(report.closed.is_empty());
    assert_eq!(
        h.count(|e| matches!(e, EngineEvent::PositionMismatch { broker, .. } if broker.is_zero())),
        1
    );
    let t = h.live();
    assert!(t.legs().find(|l| l.id == eurjpy).unwrap().is_flat());
    assert_eq!(t.live_legs().count(), 2);
    assert_eq!(h.engine.risk().open_lots(), dec!(0.2));

    // already in line: nothing reported again
    h.advance(1);
    h.tick().await;
    assert_eq!(h.count(|e| matches!(e, EngineEvent::PositionMismatch { .. })), 1);

    let rest: Vec<String> = h.live().live_legs().map(|l| l.id.clone()).collect();
    for position in rest {
        h.broker.close(&position, Decimal::ONE).await;
    }
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.closed, vec![(id, CloseReason::External)]);
    assert!(h.engine.registry().is_empty());
    assert_eq!(h.engine.risk().open_lots(), Decimal::ZERO);
}
