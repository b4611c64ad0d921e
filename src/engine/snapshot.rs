//! Read-only engine snapshot.
//!
//! Built once per tick and published on a `watch` channel; the dashboard
//! and the snapshot writer only ever see these copies.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

use super::scanner::Opportunity;
use super::tracker::{StateTransition, TriangleInstance};
use crate::broker::AccountInfo;
use crate::market::ArbDirection;
use crate::strategy::OrphanExposure;
use crate::types::{CloseReason, Leg, TriangleState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangleView {
    pub id: String,
    pub definition_id: String,
    pub direction: ArbDirection,
    pub state: TriangleState,
    pub recovery_layers: usize,
    pub recovery_exhausted: bool,
    pub legs: Vec<Leg>,
    pub open_lots: Decimal,
    pub aggregate_profit: Decimal,
    pub aggregate_pips: Decimal,
    pub realized_profit: Decimal,
    pub entry_net_pips: Decimal,
    pub opened_at: DateTime<Utc>,
    pub last_recovery_at: Option<DateTime<Utc>>,
    /// Harvest levels already fired on the current layer.
    pub harvest_fired: Vec<bool>,
    pub peak_pips: Option<Decimal>,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub transitions: Vec<StateTransition>,
}

impl From<&TriangleInstance> for TriangleView {
    fn from(t: &TriangleInstance) -> Self {
        Self {
            id: t.id.clone(),
            definition_id: t.definition.id.clone(),
            direction: t.direction,
            state: t.state,
            recovery_layers: t.recovery_layers(),
            recovery_exhausted: t.recovery_exhausted,
            legs: t.legs().cloned().collect(),
            open_lots: t.open_lots(),
            aggregate_profit: t.aggregate_profit,
            aggregate_pips: t.aggregate_pips,
            realized_profit: t.realized_profit,
            entry_net_pips: t.entry_net_pips,
            opened_at: t.opened_at,
            last_recovery_at: t.last_recovery_at,
            harvest_fired: t.harvest.fired.clone(),
            peak_pips: t.harvest.peak_pips,
            close_reason: t.close_reason,
            closed_at: t.closed_at,
            transitions: t.transitions.clone(),
        }
    }
}

/// Running performance counters since the engine started. Unlike the
/// history these are never trimmed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    pub triangles_opened: u64,
    pub triangles_closed: u64,
    pub wins: u64,
    pub losses: u64,
    /// Percent of closed triangles that realized a profit.
    pub win_rate: Decimal,
    pub realized_profit: Decimal,
    pub average_profit: Decimal,
    pub best_profit: Option<Decimal>,
    pub worst_profit: Option<Decimal>,
    pub entries_rejected: u64,
    pub recovery_layers_opened: u64,
    pub recoveries_completed: u64,
    pub harvests: u64,
}

impl EngineStats {
    pub fn record_close(&mut self, t: &TriangleInstance) {
        let profit = t.realized_profit;
        self.triangles_closed += 1;
        if profit > Decimal::ZERO {
            self.wins += 1;
        } else {
            self.losses += 1;
        }
        self.realized_profit += profit;
        self.best_profit = Some(self.best_profit.map_or(profit, |b| b.max(profit)));
        self.worst_profit = Some(self.worst_profit.map_or(profit, |w| w.min(profit)));

        let closed = Decimal::from(self.triangles_closed);
        self.win_rate = (Decimal::from(self.wins) * dec!(100) / closed).round_dp(2);
        self.average_profit = (self.realized_profit / closed).round_dp(2);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelationView {
    pub a: String,
    pub b: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub engine: String,
    pub tick: u64,
    pub taken_at: DateTime<Utc>,
    pub broker_connected: bool,
    /// New entries and recovery layers suspended by the operator.
    pub paused: bool,
    pub account: Option<AccountInfo>,
    pub open_lots: Decimal,
    pub floating_profit: Decimal,
    pub realized_profit: Decimal,
    pub triangles: Vec<TriangleView>,
    /// Most recently closed first.
    pub history: Vec<TriangleView>,
    pub opportunities: Vec<Opportunity>,
    pub stale_symbols: Vec<String>,
    pub correlations: Vec<CorrelationView>,
    /// Unreversed legs still held against exposure.
    pub orphans: Vec<OrphanExposure>,
    pub stats: EngineStats,
}

impl EngineSnapshot {
    /// Snapshot of an engine that has not ticked yet.
    pub fn empty(engine: &str, at: DateTime<Utc>) -> Self {
        Self {
            engine: engine.to_string(),
            tick: 0,
            taken_at: at,
            broker_connected: false,
            paused: false,
            account: None,
            open_lots: Decimal::ZERO,
            floating_profit: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            triangles: Vec::new(),
            history: Vec::new(),
            opportunities: Vec::new(),
            stale_symbols: Vec::new(),
            correlations: Vec::new(),
            orphans: Vec::new(),
            stats: EngineStats::default(),
        }
    }

    pub fn triangle(&self, id: &str) -> Option<&TriangleView> {
        self.triangles.iter().find(|t| t.id == id)
    }

    pub fn in_state(&self, state: TriangleState) -> usize {
        self.triangles.iter().filter(|t| t.state == state).count()
    }
}
