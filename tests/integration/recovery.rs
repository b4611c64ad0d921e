//! Correlated recovery layers and the emergency rules around them.

use rust_decimal_macros::dec;

use helix::engine::events::EngineEvent;
use helix::market::CorrelationMatrix;
use helix::types::{CloseReason, Direction, TriangleState};

use crate::support::{config, Harness};

#[tokio::test]
async fn test_loss_opens_correlated_layer() {
    let mut h = Harness::new(config());
    h.open_forward().await;

    // EURUSD sell leg 29 pips under water
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    let report = h.tick().await;

    assert_eq!(report.recoveries.len(), 1);
    let t = h.live();
    assert_eq!(t.state, TriangleState::Recovering);
    assert_eq!(t.recovery_layers(), 1);
    let hedge = &t.layers[1].legs[0];
    assert_eq!(hedge.symbol, "GBPUSD");
    assert_eq!(hedge.direction, Direction::Buy);
    assert_eq!(hedge.volume, dec!(0.15));
    assert_eq!(hedge.open_price, dec!(1.2652));
    assert_eq!(t.layers[1].correlation, vec![("GBPUSD".to_string(), 0.85)]);

    assert_eq!(h.engine.risk().open_lots(), dec!(0.45));
    assert_eq!(h.broker.open_positions().len(), 4);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::RecoveryLayerOpened { layer: 1, .. })), 1);
    assert_eq!(
        h.count(|e| matches!(e, EngineEvent::StateChanged { to: TriangleState::Recovering, .. })),
        1
    );
}

#[tokio::test]
async fn test_profitable_hedge_completes_recovery() {
    let mut h = Harness::new(config());
    h.open_forward().await;
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    h.tick().await;
    assert_eq!(h.live().state, TriangleState::Recovering);

    // GBPUSD +23 pips on 0.15 lots against EURUSD -29 on 0.1: +5.5 net
    h.quote("GBPUSD", dec!(1.2675), dec!(1.2677));
    h.advance(1);
    let report = h.tick().await;

    assert_eq!(report.completed_recoveries.len(), 1);
    let t = h.live();
    assert_eq!(t.state, TriangleState::Open);
    assert!(t.layers[1].legs[0].is_flat());
    assert_eq!(t.realized_profit, dec!(34.5));
    assert_eq!(h.engine.risk().open_lots(), dec!(0.3));
    assert_eq!(h.broker.open_positions().len(), 3);
    assert_eq!(
        h.count(|e| matches!(e, EngineEvent::RecoveryCompleted { layers: 1, .. })),
        1
    );
    assert_eq!(h.engine.stats().recoveries_completed, 1);
}

#[tokio::test]
async fn test_next_layer_waits_for_delay_and_deeper_loss() {
    let mut h = Harness::new(config());
    h.open_forward().await;
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    h.tick().await;

    // same loss a minute later: layer 2 needs -40
    h.advance(60);
    let report = h.tick().await;
    assert!(report.recoveries.is_empty());

    // -40 on EURUSD plus -2 pips on 1.5× base volume of GBPUSD
    h.flat("EURUSD", dec!(1.2539875));
    h.advance(1);
    h.tick().await;
    assert_eq!(h.live().aggregate_pips, dec!(-43));
    assert_eq!(h.live().recovery_layers(), 2);
    let layer_two = &h.live().layers[2];
    assert_eq!(layer_two.legs[0].volume, dec!(0.23));

    // layer 3 threshold is -60; deepen and check the delay holds it back
    h.flat("EURUSD", dec!(1.2559875));
    h.advance(10);
    let report = h.tick().await;
    assert!(report.recoveries.is_empty());
    assert_eq!(h.live().recovery_layers(), 2);

    h.advance(25);
    let report = h.tick().await;
    assert_eq!(report.recoveries.len(), 1);
    let t = h.live();
    assert_eq!(t.recovery_layers(), 3);
    for pair in t.layers[1..].windows(2) {
        assert!(pair[1].opened_at - pair[0].opened_at >= chrono::Duration::seconds(30));
    }
}

#[tokio::test]
async fn test_exhaustion_reported_once() {
    let mut cfg = config();
    cfg.recovery.max_recovery_layers = 1;
    let mut h = Harness::new(cfg);
    h.open_forward().await;
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    h.tick().await;

    h.flat("EURUSD", dec!(1.2539875));
    for _ in 0..4 {
        h.advance(40);
        let report = h.tick().await;
        assert!(report.recoveries.is_empty());
    }

    let t = h.live();
    assert_eq!(t.recovery_layers(), 1);
    assert!(t.recovery_exhausted);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::RecoveryExhausted { layers: 1, .. })), 1);
    assert!(h.engine.snapshot().triangles[0].recovery_exhausted);
}

#[tokio::test]
async fn test_missing_hedge_reported_once_per_layer() {
    let mut h = Harness::new(config());
    h.open_forward().await;
    h.engine.update_correlations(CorrelationMatrix::new());
    assert_eq!(h.count(|e| matches!(e, EngineEvent::CorrelationsUpdated { pairs: 0 })), 1);

    h.flat("EURUSD", dec!(1.2528875));
    for _ in 0..3 {
        h.advance(1);
        let report = h.tick().await;
        assert!(report.recoveries.is_empty());
    }

    assert_eq!(h.live().recovery_layers(), 0);
    assert_eq!(h.live().state, TriangleState::Open);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::RecoveryFailed { layer: 1, .. })), 1);

    // the hedge comes back: no delay was consumed by the misses
    let mut matrix = CorrelationMatrix::new();
    matrix.set("EURUSD", "GBPUSD", 0.9);
    h.engine.update_correlations(matrix);
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.recoveries.len(), 1);
}

#[tokio::test]
async fn test_disabled_recovery_never_hedges() {
    let mut cfg = config();
    cfg.recovery.enabled = false;
    let mut h = Harness::new(cfg);
    h.open_forward().await;
    h.flat("EURUSD", dec!(1.2599875));
    h.advance(1);
    h.tick().await;

    assert_eq!(h.live().recovery_layers(), 0);
    assert_eq!(h.live().aggregate_pips, dec!(-100));
    assert_eq!(h.broker.open_positions().len(), 3);
}

#[tokio::test]
async fn test_emergency_stop_closes_everything() {
    let mut cfg = config();
    cfg.recovery.enabled = false;
    cfg.risk.emergency_stop_pips = Some(dec!(100));
    let mut h = Harness::new(cfg);
    let id = h.open_forward().await;
    h.block_entries();

    h.flat("EURUSD", dec!(1.2619875));
    h.advance(1);
    let report = h.tick().await;

    assert_eq!(report.closed, vec![(id.clone(), CloseReason::EmergencyStop)]);
    assert!(h.engine.registry().is_empty());
    assert!(h.broker.open_positions().is_empty());
    let closed = h.engine.registry().history().next().unwrap();
    // -120 pips × 0.1 lots × 10
    assert_eq!(closed.realized_profit, dec!(-120));
    assert_eq!(h.broker.balance(), dec!(9880));
    assert_eq!(h.engine.risk().open_lots(), dec!(0));
}

#[tokio::test]
async fn test_recovery_timeout_closes_triangle() {
    let mut cfg = config();
    cfg.recovery.max_recovery_secs = Some(60);
    let mut h = Harness::new(cfg);
    let id = h.open_forward().await;
    h.block_entries();
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    h.tick().await;
    assert_eq!(h.live().recovery_layers(), 1);

    h.advance(30);
    let report = h.tick().await;
    assert!(report.closed.is_empty());

    h.advance(30);
    let report = h.tick().await;
    assert_eq!(report.closed, vec![(id, CloseReason::RecoveryTimeout)]);
    assert!(h.broker.open_positions().is_empty());
}

#[tokio::test]
async fn test_max_age_closes_triangle() {
    let mut cfg = config();
    cfg.risk.max_triangle_age_secs = Some(3_600);
    let mut h = Harness::new(cfg);
    let id = h.open_forward().await;

    h.advance(3_599);
    assert!(h.tick().await.closed.is_empty());
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.closed, vec![(id, CloseReason::MaxAge)]);
}

#[tokio::test]
async fn test_rejected_emergency_close_is_retried() {
    let mut cfg = config();
    cfg.recovery.enabled = false;
    cfg.risk.emergency_stop_pips = Some(dec!(100));
    let mut h = Harness::new(cfg);
    h.open_forward().await;
    h.block_entries();

    // the losing leg stays open, so the stop still applies next tick
    h.broker.reject_closes_for("EURUSD");
    h.flat("EURUSD", dec!(1.2619875));
    h.advance(1);
    let report = h.tick().await;

    assert!(report.closed.is_empty());
    let t = h.live();
    assert_ne!(t.state, TriangleState::Closed);
    let remaining: Vec<&str> = t.live_legs().map(|l| l.symbol.as_str()).collect();
    assert_eq!(remaining, vec!["EURUSD"]);
    assert_eq!(t.aggregate_pips, dec!(-120));
    assert_eq!(h.count(|e| matches!(e, EngineEvent::CloseFailed { .. })), 1);

    h.broker.clear_faults();
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.closed.len(), 1);
    assert!(h.broker.open_positions().is_empty());
    assert_eq!(h.broker.balance(), dec!(9880));
}
