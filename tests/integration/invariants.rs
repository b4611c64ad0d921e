//! Long random walk through the engine, checking the bookkeeping after
//! every tick.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::BTreeMap;

use helix::clock::Clock;
use helix::types::pip_size;

use crate::support::{config, Harness};

const SYMBOLS: [&str; 4] = ["EURUSD", "USDJPY", "EURJPY", "GBPUSD"];

#[tokio::test]
async fn test_random_walk_keeps_books_consistent() {
    let cfg = config();
    let max_layers = cfg.recovery.max_recovery_layers as usize;
    let hedges_per_layer = cfg.recovery.hedges_per_layer;
    let delay = cfg.recovery.recovery_delay();
    let mut h = Harness::new(cfg);

    let mut rng = StdRng::seed_from_u64(0x4e11c5);
    let mut mids: BTreeMap<&str, Decimal> = BTreeMap::from([
        ("EURUSD", dec!(1.2500)),
        ("USDJPY", dec!(130.00)),
        ("EURJPY", dec!(162.295)),
        ("GBPUSD", dec!(1.2651)),
    ]);

    let mut opened = 0;
    let mut activity = 0;
    for _ in 0..400 {
        h.advance(5);
        for symbol in SYMBOLS {
            let step = Decimal::from(rng.gen_range(-3i64..=3)) * pip_size(symbol);
            let mid = mids.entry(symbol).or_default();
            *mid += step;
            h.broker.set_mid(symbol, *mid, dec!(0.5), h.clock.now());
        }

        let report = h.tick().await;
        opened += report.opened.len();
        activity += report.recoveries.len() + report.harvests.len() + report.closed.len();

        let mut live_legs = BTreeMap::new();
        let mut live_lots = Decimal::ZERO;
        for t in h.engine.registry().iter() {
            assert_eq!(t.aggregate_profit, t.leg_sum(), "{} cached aggregate drifted", t.id);
            assert!(t.recovery_layers() <= max_layers);
            assert_eq!(t.layers[0].legs.len(), 3);
            for layer in &t.layers[1..] {
                assert!(!layer.legs.is_empty() && layer.legs.len() <= hedges_per_layer);
            }
            for pair in t.layers[1..].windows(2) {
                assert!(pair[1].opened_at - pair[0].opened_at >= delay);
            }
            for leg in t.live_legs() {
                live_legs.insert(leg.id.clone(), leg.volume);
            }
            live_lots += t.open_lots();
        }

        let broker_positions: BTreeMap<String, Decimal> = h
            .broker
            .open_positions()
            .into_iter()
            .map(|p| (p.id, p.volume))
            .collect();
        assert_eq!(broker_positions, live_legs, "broker and tracker disagree");
        assert_eq!(h.engine.risk().open_lots(), live_lots);
    }

    assert!(opened > 0);
    assert!(activity > 0);
}
