//! Engine events.
//!
//! Every execution attempt, recovery action, harvest, state transition and
//! surfaced failure becomes an `EventRecord`. Records are logged through
//! `tracing` and fanned out to every registered `EventSink` (JSONL storage,
//! the dashboard's in-memory ring, tests).

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{info, warn};

use super::executor::OrphanedFill;
use crate::market::ArbDirection;
use crate::types::{CloseReason, Direction, TriangleState};

/// A confirmed fill, as reported in events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LegFill {
    pub position_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    TriangleOpened {
        triangle_id: String,
        definition_id: String,
        direction: ArbDirection,
        net_pips: Decimal,
        legs: Vec<LegFill>,
    },
    ExecutionFailed {
        definition_id: String,
        error: String,
        /// Position ids that were filled and then reversed.
        reversed: Vec<String>,
    },
    /// A filled leg could not be reversed. It stays booked against its
    /// definition and the engine keeps trying to close it.
    OrphanedPosition {
        definition_id: String,
        position_id: String,
        symbol: String,
        volume: Decimal,
        reason: String,
    },
    OrphanClosed {
        definition_id: String,
        position_id: String,
        symbol: String,
        realized: Decimal,
    },
    RecoveryLayerOpened {
        triangle_id: String,
        layer: u32,
        aggregate_pips: Decimal,
        correlation: Vec<(String, f64)>,
        legs: Vec<LegFill>,
    },
    RecoveryFailed {
        triangle_id: String,
        layer: u32,
        error: String,
    },
    RecoveryExhausted {
        triangle_id: String,
        layers: usize,
    },
    /// Hedges plus hedged legs turned profitable; every recovery leg was closed.
    RecoveryCompleted {
        triangle_id: String,
        layers: usize,
        realized: Decimal,
    },
    HarvestExecuted {
        triangle_id: String,
        level: String,
        fraction: Decimal,
        realized: Decimal,
        closed_positions: Vec<String>,
    },
    CloseFailed {
        triangle_id: String,
        position_id: String,
        reason: String,
    },
    StateChanged {
        triangle_id: String,
        from: TriangleState,
        to: TriangleState,
        reason: String,
    },
    TriangleClosed {
        triangle_id: String,
        reason: CloseReason,
        realized_profit: Decimal,
    },
    /// Tracked floating profit disagreed with the broker's; the broker's was kept.
    PnlDivergence {
        triangle_id: String,
        cached: Decimal,
        actual: Decimal,
    },
    /// A tracked leg's volume disagreed with the broker position (zero when
    /// the position is gone); the broker's volume was kept.
    PositionMismatch {
        triangle_id: String,
        position_id: String,
        tracked: Decimal,
        broker: Decimal,
    },
    BrokerDisconnected,
    BrokerReconnected,
    CorrelationsUpdated {
        pairs: usize,
    },
    EnginePaused,
    EngineResumed,
}

impl EngineEvent {
    pub fn orphaned(definition_id: &str, orphan: &OrphanedFill) -> Self {
        EngineEvent::OrphanedPosition {
            definition_id: definition_id.to_string(),
            position_id: orphan.position_id.clone(),
            symbol: orphan.symbol.clone(),
            volume: orphan.volume,
            reason: orphan.reason.clone(),
        }
    }

    /// Events the operator must see (warn level).
    pub fn is_surfaced(&self) -> bool {
        matches!(
            self,
            EngineEvent::ExecutionFailed { .. }
                | EngineEvent::OrphanedPosition { .. }
                | EngineEvent::RecoveryFailed { .. }
                | EngineEvent::RecoveryExhausted { .. }
                | EngineEvent::CloseFailed { .. }
                | EngineEvent::PnlDivergence { .. }
                | EngineEvent::PositionMismatch { .. }
                | EngineEvent::BrokerDisconnected
        )
    }

    pub fn triangle_id(&self) -> Option<&str> {
        match self {
            EngineEvent::TriangleOpened { triangle_id, .. }
            | EngineEvent::RecoveryLayerOpened { triangle_id, .. }
            | EngineEvent::RecoveryFailed { triangle_id, .. }
            | EngineEvent::RecoveryExhausted { triangle_id, .. }
            | EngineEvent::RecoveryCompleted { triangle_id, .. }
            | EngineEvent::HarvestExecuted { triangle_id, .. }
            | EngineEvent::CloseFailed { triangle_id, .. }
            | EngineEvent::StateChanged { triangle_id, .. }
            | EngineEvent::TriangleClosed { triangle_id, .. }
            | EngineEvent::PnlDivergence { triangle_id, .. }
            | EngineEvent::PositionMismatch { triangle_id, .. } => Some(triangle_id.as_str()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub event: EngineEvent,
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Append-only consumer of engine events.
pub trait EventSink: Send + Sync {
    fn record(&self, record: &EventRecord);
}

/// Bounded in-memory ring of recent events.
pub struct MemorySink {
    capacity: usize,
    records: Mutex<VecDeque<EventRecord>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<EventRecord> {
        self.records.lock().iter().rev().take(limit).cloned().collect()
    }

    pub fn all(&self) -> Vec<EventRecord> {
        self.records.lock().iter().cloned().collect()
    }

    pub fn count(&self, pred: impl Fn(&EngineEvent) -> bool) -> usize {
        self.records.lock().iter().filter(|r| pred(&r.event)).count()
    }
}

impl EventSink for MemorySink {
    fn record(&self, record: &EventRecord) {
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
    }
}

/// Logs each event and fans it out to the registered sinks.
#[derive(Clone, Default)]
pub struct EventBus {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.sinks.push(sink);
    }

    pub fn emit(&self, at: DateTime<Utc>, event: EngineEvent) {
        let triangle = event.triangle_id().unwrap_or("-").to_string();
        if event.is_surfaced() {
            warn!(triangle = %triangle, event = ?event, "Engine event");
        } else {
            info!(triangle = %triangle, event = ?event, "Engine event");
        }
        let record = EventRecord { at, event };
        for sink in &self.sinks {
            sink.record(&record);
        }
    }
}
