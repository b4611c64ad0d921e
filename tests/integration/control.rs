//! Operator control: pause, resume, close-all and the running totals.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use helix::broker::paper::PaperBroker;
use helix::clock::ManualClock;
use helix::engine::events::EngineEvent;
use helix::engine::{Engine, EngineCommand};
use helix::types::{CloseReason, EngineError, TriangleState};

use crate::support::{config, Harness};

#[tokio::test]
async fn test_pause_blocks_entries_until_resumed() {
    let mut h = Harness::new(config());
    h.engine.pause();
    let report = h.tick().await;

    assert!(report.paused);
    assert_eq!(report.ready, 1);
    assert!(report.opened.is_empty());
    assert!(h.broker.submissions().is_empty());
    assert!(h.engine.snapshot().paused);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::EnginePaused)), 1);

    h.engine.resume();
    h.advance(1);
    let report = h.tick().await;
    assert!(!report.paused);
    assert_eq!(report.opened.len(), 1);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::EngineResumed)), 1);
}

#[tokio::test]
async fn test_pause_holds_back_recovery_layers() {
    let mut h = Harness::new(config());
    h.open_forward().await;
    h.engine.pause();

    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    let report = h.tick().await;
    assert!(report.recoveries.is_empty());
    let t = h.live();
    assert_eq!(t.state, TriangleState::Open);
    assert_eq!(t.aggregate_pips, dec!(-29));

    h.engine.resume();
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.recoveries.len(), 1);
    assert_eq!(h.live().state, TriangleState::Recovering);
}

#[tokio::test]
async fn test_close_all_flattens_and_stays_paused() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;

    let closed = h.engine.close_all().await.unwrap();
    assert_eq!(closed, 1);
    assert!(h.engine.is_paused());
    assert!(h.engine.registry().is_empty());
    assert!(h.broker.open_positions().is_empty());
    assert_eq!(h.engine.risk().open_lots(), Decimal::ZERO);
    let history = h.engine.registry().history().next().unwrap();
    assert_eq!(history.id, id);
    assert_eq!(history.close_reason, Some(CloseReason::CloseAll));

    // the dislocation is still there but nothing reopens
    h.dislocated();
    h.advance(1);
    let report = h.tick().await;
    assert!(report.opened.is_empty());
    assert_eq!(h.engine.snapshot().stats.triangles_closed, 1);
}

#[tokio::test]
async fn test_close_all_retries_rejected_leg() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;
    h.broker.reject_closes_for("EURUSD");

    let err = h.engine.close_all().await.unwrap_err();
    assert!(matches!(err, EngineError::CloseRejected { .. }));
    let t = h.live();
    assert_eq!(t.pending_close, Some(CloseReason::CloseAll));
    assert_eq!(t.live_legs().count(), 1);

    h.broker.clear_faults();
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.closed, vec![(id, CloseReason::CloseAll)]);
    assert!(h.broker.open_positions().is_empty());
}

#[tokio::test]
async fn test_stats_count_closed_triangles() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;

    // EURJPY buy leg +5 pips, closed by hand
    h.flat("EURJPY", dec!(162.35));
    h.engine.apply(EngineCommand::CloseTriangle(id)).await.unwrap();

    let stats = h.engine.stats();
    assert_eq!(stats.triangles_opened, 1);
    assert_eq!(stats.triangles_closed, 1);
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.losses, 0);
    assert_eq!(stats.win_rate, dec!(100));
    assert_eq!(stats.realized_profit, dec!(5));
    assert_eq!(stats.best_profit, Some(dec!(5)));
    assert_eq!(h.engine.snapshot().stats, *stats);
}

#[tokio::test]
async fn test_queued_command_applied_by_run_loop() {
    let mut h = Harness::new(config());
    h.engine.commands().try_send(EngineCommand::Pause).unwrap();
    h.engine
        .run(async {
            tokio::time::sleep(Duration::from_millis(300)).await;
        })
        .await;

    assert!(h.engine.is_paused());
    assert!(h.engine.snapshot().paused);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::EnginePaused)), 1);
}

#[test]
fn test_engine_rejects_unrepresentable_durations() {
    let mut cfg = config();
    cfg.risk.max_triangle_age_secs = Some(u64::MAX);
    let broker = Arc::new(PaperBroker::new(dec!(10000), dec!(10), dec!(1000)));
    let clock = Arc::new(ManualClock::new(chrono::Utc::now()));
    let result = Engine::new(cfg, broker.clone(), broker, clock);
    assert!(matches!(result, Err(EngineError::Config(_))));
}
