//! Shared harness for the integration suite.

use chrono::{Duration, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

use helix::broker::paper::PaperBroker;
use helix::clock::{Clock, ManualClock};
use helix::config::{AppConfig, CorrelationSeed};
use helix::engine::events::{EngineEvent, MemorySink};
use helix::engine::tracker::TriangleInstance;
use helix::engine::{Engine, TickReport};

pub const TRIANGLE: &str = "EURUSD-USDJPY-EURJPY";

/// Four symbols: one triangle plus GBPUSD as the recovery hedge for EURUSD.
pub fn config() -> AppConfig {
    let mut cfg = AppConfig::default();
    cfg.trading.symbols = ["EURUSD", "USDJPY", "EURJPY", "GBPUSD"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    cfg.sizing.base_lot_size = dec!(0.1);
    cfg.correlation.seed = vec![CorrelationSeed {
        a: "EURUSD".into(),
        b: "GBPUSD".into(),
        coefficient: 0.85,
    }];
    cfg.correlation.refresh_secs = 86_400;
    cfg.execution.fill_timeout_ms = 100;
    cfg.recovery.max_recovery_secs = None;
    cfg
}

pub struct Harness {
    pub broker: Arc<PaperBroker>,
    pub clock: Arc<ManualClock>,
    pub events: Arc<MemorySink>,
    pub engine: Engine,
}

impl Harness {
    pub fn new(cfg: AppConfig) -> Self {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap()));
        let broker = Arc::new(PaperBroker::new(
            dec!(10000),
            cfg.engine.pip_value_per_lot,
            cfg.risk.margin_per_lot,
        ));
        let events = Arc::new(MemorySink::new(10_000));
        let engine = Engine::new(cfg, broker.clone(), broker.clone(), clock.clone())
            .unwrap()
            .with_sink(events.clone());
        let h = Self {
            broker,
            clock,
            events,
            engine,
        };
        h.dislocated();
        h
    }

    pub fn quote(&self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.broker.set_quote(symbol, bid, ask, self.clock.now());
    }

    /// Zero-spread quote.
    pub fn flat(&self, symbol: &str, price: Decimal) {
        self.quote(symbol, price, price);
    }

    /// Synthetic EUR/JPY 1.25 × 130.00 = 162.50 against a 162.29/162.30
    /// cross: 20 pips of deviation, 1.5 pips of spread.
    pub fn dislocated(&self) {
        self.quote("EURUSD", dec!(1.2499875), dec!(1.2500125));
        self.quote("USDJPY", dec!(129.99875), dec!(130.00125));
        self.quote("EURJPY", dec!(162.29), dec!(162.30));
        self.quote("GBPUSD", dec!(1.2650), dec!(1.2652));
    }

    /// Zero-spread quotes at the forward entry's fill prices: every
    /// layer-0 leg marks at 0 pips.
    pub fn at_entry(&self) {
        self.flat("EURUSD", dec!(1.2499875));
        self.flat("USDJPY", dec!(129.99875));
        self.flat("EURJPY", dec!(162.30));
        self.quote("GBPUSD", dec!(1.2650), dec!(1.2652));
    }

    /// Widen the EURJPY ask past the spread limit so nothing new opens.
    /// The bid, and with it the EURJPY buy leg's mark, stays at entry.
    pub fn block_entries(&self) {
        self.quote("EURJPY", dec!(162.30), dec!(162.40));
    }

    /// Move the clock and keep every quote fresh.
    pub fn advance(&self, secs: i64) {
        self.clock.advance(Duration::seconds(secs));
        self.broker.touch_all(self.clock.now());
    }

    pub async fn tick(&mut self) -> TickReport {
        self.engine.tick().await
    }

    /// The single live triangle.
    pub fn live(&self) -> &TriangleInstance {
        let mut live = self.engine.registry().iter();
        let first = live.next().expect("a live triangle");
        assert!(live.next().is_none(), "more than one live triangle");
        first
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.events.count(pred)
    }

    /// Open the forward triangle and park the quotes at its entry prices.
    pub async fn open_forward(&mut self) -> String {
        let report = self.tick().await;
        assert_eq!(report.opened.len(), 1, "gate failures: {:?}", report.gate_failures);
        self.at_entry();
        report.opened[0].clone()
    }
}
