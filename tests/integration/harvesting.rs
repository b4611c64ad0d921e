//! Level and trailing harvests driven through the engine.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use helix::config::HarvestMode;
use helix::engine::events::EngineEvent;
use helix::types::{CloseReason, TriangleState};

use crate::support::{config, Harness};

#[tokio::test]
async fn test_levels_scale_out_then_close_at_final_target() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;

    // EURJPY buy leg +9 pips; the 10-pip cross spread keeps the scanner quiet
    h.quote("EURJPY", dec!(162.39), dec!(162.49));
    h.advance(1);
    let report = h.tick().await;

    assert_eq!(report.harvests, vec![(id.clone(), vec!["quick_scalp".to_string()])]);
    let t = h.live();
    assert_eq!(t.state, TriangleState::Open);
    // a quarter of 0.1 rounds to 0.03 on the 0.01 lot step
    assert_eq!(t.realized_profit, dec!(2.7));
    let eurjpy = t.legs().find(|l| l.symbol == "EURJPY").unwrap();
    assert_eq!(eurjpy.volume, dec!(0.07));
    // only the contributing leg was touched
    assert!(t.legs().filter(|l| l.symbol != "EURJPY").all(|l| l.volume == dec!(0.1)));
    // pips stay in base-lot terms after the partial close
    assert_eq!(t.aggregate_pips, dec!(9));
    assert_eq!(t.aggregate_profit, dec!(6.3));
    assert_eq!(h.engine.risk().open_lots(), dec!(0.27));

    let transitions: Vec<(TriangleState, TriangleState)> = t.transitions.iter().map(|s| (s.from, s.to)).collect();
    assert_eq!(
        transitions,
        vec![
            (TriangleState::Scanning, TriangleState::Open),
            (TriangleState::Open, TriangleState::Harvesting),
            (TriangleState::Harvesting, TriangleState::Open),
        ]
    );

    // same level does not fire twice
    h.advance(1);
    assert!(h.tick().await.harvests.is_empty());
    assert_eq!(h.count(|e| matches!(e, EngineEvent::HarvestExecuted { .. })), 1);

    // +41 pips: past every remaining level, the last one closes everything
    h.quote("EURJPY", dec!(162.71), dec!(162.81));
    h.advance(1);
    let report = h.tick().await;

    assert_eq!(report.closed, vec![(id.clone(), CloseReason::FinalTarget)]);
    assert!(h.engine.registry().is_empty());
    assert!(h.broker.open_positions().is_empty());
    assert_eq!(h.engine.risk().open_lots(), Decimal::ZERO);

    let closed = h.engine.registry().history().next().unwrap();
    // 2.7 + 41 pips × 0.07 lots × 10
    assert_eq!(closed.realized_profit, dec!(31.4));
    assert_eq!(h.broker.balance(), dec!(10031.4));

    let snapshot = h.engine.snapshot();
    assert!(snapshot.triangles.is_empty());
    assert_eq!(snapshot.history[0].close_reason, Some(CloseReason::FinalTarget));
    assert_eq!(snapshot.realized_profit, dec!(31.4));
    assert_eq!(snapshot.stats.triangles_closed, 1);
    assert_eq!(snapshot.stats.harvests, 1);
}

#[tokio::test]
async fn test_final_close_retried_after_pullback() {
    let mut h = Harness::new(config());
    let id = h.open_forward().await;
    h.broker.reject_closes_for("USDJPY");

    h.quote("EURJPY", dec!(162.71), dec!(162.81));
    h.advance(1);
    let report = h.tick().await;
    assert!(report.closed.is_empty());
    let t = h.live();
    assert_eq!(t.pending_close, Some(CloseReason::FinalTarget));
    let remaining: Vec<&str> = t.live_legs().map(|l| l.symbol.as_str()).collect();
    assert_eq!(remaining, vec!["USDJPY"]);
    assert_eq!(h.count(|e| matches!(e, EngineEvent::CloseFailed { .. })), 1);

    // the cross falls back under every level; the close still completes
    h.broker.clear_faults();
    h.block_entries();
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.closed, vec![(id, CloseReason::FinalTarget)]);
    assert!(h.broker.open_positions().is_empty());
    assert_eq!(h.engine.risk().open_lots(), Decimal::ZERO);
    // 41 pips × 0.1 lots × 10 on EURJPY, the other legs flat
    assert_eq!(h.broker.balance(), dec!(10041));
}

#[tokio::test]
async fn test_all_legs_scope_reduces_every_leg() {
    let mut cfg = config();
    cfg.harvest.scope = helix::config::HarvestScope::AllLegs;
    let mut h = Harness::new(cfg);
    h.open_forward().await;

    h.quote("EURJPY", dec!(162.39), dec!(162.49));
    h.advance(1);
    h.tick().await;

    let t = h.live();
    assert!(t.legs().all(|l| l.volume == dec!(0.07)));
    assert_eq!(t.realized_profit, dec!(2.7));
    assert_eq!(h.engine.risk().open_lots(), dec!(0.21));
}

#[tokio::test]
async fn test_losing_triangle_is_never_harvested() {
    let mut h = Harness::new(config());
    h.open_forward().await;

    h.flat("EURUSD", dec!(1.2509875));
    h.advance(1);
    let report = h.tick().await;

    assert!(report.harvests.is_empty());
    assert_eq!(h.live().aggregate_pips, dec!(-10));
    assert!(h.broker.closes().is_empty());
}

#[tokio::test]
async fn test_trailing_stop_follows_the_peak() {
    let mut cfg = config();
    cfg.harvest.mode = HarvestMode::Trailing;
    let mut h = Harness::new(cfg);
    let id = h.open_forward().await;

    // +20: armed (activation 15), stop at 20 - (10 - 0.25 × 5) = 11.25
    h.quote("EURJPY", dec!(162.50), dec!(162.60));
    h.advance(1);
    assert!(h.tick().await.closed.is_empty());
    assert_eq!(h.live().harvest.peak_pips, Some(dec!(20)));

    // +12 is above the stop
    h.quote("EURJPY", dec!(162.42), dec!(162.52));
    h.advance(1);
    assert!(h.tick().await.closed.is_empty());
    assert_eq!(h.live().harvest.peak_pips, Some(dec!(20)));

    // +11 hits it
    h.quote("EURJPY", dec!(162.41), dec!(162.51));
    h.advance(1);
    let report = h.tick().await;
    assert_eq!(report.closed, vec![(id, CloseReason::TrailingStop)]);
    assert_eq!(h.broker.balance(), dec!(10011));
    assert!(h.broker.open_positions().is_empty());
}

#[tokio::test]
async fn test_harvest_while_recovering_keeps_recovering() {
    let mut h = Harness::new(config());
    h.open_forward().await;
    h.flat("EURUSD", dec!(1.2528875));
    h.advance(1);
    h.tick().await;
    assert_eq!(h.live().state, TriangleState::Recovering);

    // EURUSD -2, EURJPY +13, GBPUSD hedge -2 × 1.5: aggregate +8 while the
    // hedge and its losing leg are still net negative
    h.flat("EURUSD", dec!(1.2501875));
    h.quote("EURJPY", dec!(162.43), dec!(162.53));
    h.advance(1);
    let report = h.tick().await;

    assert_eq!(report.harvests.len(), 1);
    assert!(report.completed_recoveries.is_empty());
    let t = h.live();
    assert_eq!(t.state, TriangleState::Recovering);
    let eurjpy = t.legs().find(|l| l.symbol == "EURJPY").unwrap();
    assert_eq!(eurjpy.volume, dec!(0.07));
    assert_eq!(t.realized_profit, dec!(3.9));
    // the hedge is not in profit and was left alone
    assert_eq!(t.layers[1].legs[0].volume, dec!(0.15));
}
