//! Triangle position tracker.
//!
//! Owns every live triangle instance and its legs. An instance moves through
//!
//! ```text
//! Open ⇄ Recovering
//!   ↘      ↙
//!  Harvesting → (back to prior state) ... → Closed
//! ```
//!
//! `Scanning` is the state of a definition with no instance; the registry
//! only ever holds `Open`, `Recovering` or `Harvesting` instances, and moves
//! `Closed` ones into a bounded history.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use tracing::info;

use super::events::LegFill;
use crate::broker::BrokerPosition;
use crate::market::{ArbDirection, QuoteBook, TriangleDefinition};
use crate::types::{CloseReason, EngineError, Leg, TriangleState};

/// Divergence between tracked and broker floating profit that gets reported.
pub const PNL_TOLERANCE: Decimal = dec!(0.01);

// ---------------------------------------------------------------------------
// Instance parts
// ---------------------------------------------------------------------------

/// One generation of positions. Layer 0 is the original triangle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Layer {
    pub number: u32,
    pub legs: Vec<Leg>,
    pub opened_at: DateTime<Utc>,
    /// Total lots at open; harvest percentages refer to this.
    pub starting_volume: Decimal,
    /// Correlations that selected this layer's hedges (empty for layer 0).
    #[serde(default)]
    pub correlation: Vec<(String, f64)>,
    /// Position id of the losing leg this layer hedges.
    #[serde(default)]
    pub hedged: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: TriangleState,
    pub to: TriangleState,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Harvest bookkeeping for the current layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HarvestProgress {
    /// One flag per configured level.
    pub fired: Vec<bool>,
    /// Percent of the layer's starting volume already closed by levels.
    pub closed_pct: Decimal,
    /// Highest aggregate pips seen (trailing mode).
    pub peak_pips: Option<Decimal>,
}

impl HarvestProgress {
    pub fn new(levels: usize) -> Self {
        Self {
            fired: vec![false; levels],
            ..Self::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Triangle instance
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriangleInstance {
    pub id: String,
    pub definition: TriangleDefinition,
    pub direction: ArbDirection,
    /// Mean layer-0 lots per leg at open.
    pub base_volume: Decimal,
    pub entry_net_pips: Decimal,
    pub layers: Vec<Layer>,
    pub state: TriangleState,
    pub transitions: Vec<StateTransition>,
    pub aggregate_profit: Decimal,
    pub aggregate_pips: Decimal,
    pub realized_profit: Decimal,
    pub opened_at: DateTime<Utc>,
    pub first_recovery_at: Option<DateTime<Utc>>,
    pub last_recovery_at: Option<DateTime<Utc>>,
    /// Last recovery attempt, successful or not; gates the recovery delay.
    pub last_recovery_attempt_at: Option<DateTime<Utc>>,
    pub recovery_exhausted: bool,
    /// Layer number for which a missing hedge was already reported.
    #[serde(default)]
    pub hedge_miss_reported: Option<u32>,
    pub harvest: HarvestProgress,
    /// A close-all that left legs open; retried every connected tick.
    #[serde(default)]
    pub pending_close: Option<CloseReason>,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
}

/// What reconciling the legs against broker positions changed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Reconciliation {
    /// `(position_id, tracked, broker)` volumes; broker is zero for a
    /// position the broker no longer reports.
    pub volumes: Vec<(String, Decimal, Decimal)>,
    /// `(tracked, broker)` floating profit over the live legs.
    pub pnl: Option<(Decimal, Decimal)>,
}

impl Reconciliation {
    pub fn is_clean(&self) -> bool {
        self.volumes.is_empty() && self.pnl.is_none()
    }
}

impl TriangleInstance {
    pub fn open(
        id: String,
        definition: TriangleDefinition,
        direction: ArbDirection,
        entry_net_pips: Decimal,
        fills: &[LegFill],
        harvest_levels: usize,
        now: DateTime<Utc>,
    ) -> Self {
        let legs: Vec<Leg> = fills.iter().map(|f| leg_from_fill(f, &id, 0, now)).collect();
        let starting_volume: Decimal = legs.iter().map(|l| l.volume).sum();
        let base_volume = if legs.is_empty() {
            Decimal::ZERO
        } else {
            starting_volume / Decimal::from(legs.len())
        };

        let mut instance = Self {
            id,
            definition,
            direction,
            base_volume,
            entry_net_pips,
            layers: vec![Layer {
                number: 0,
                legs,
                opened_at: now,
                starting_volume,
                correlation: Vec::new(),
                hedged: None,
            }],
            state: TriangleState::Scanning,
            transitions: Vec::new(),
            aggregate_profit: Decimal::ZERO,
            aggregate_pips: Decimal::ZERO,
            realized_profit: Decimal::ZERO,
            opened_at: now,
            first_recovery_at: None,
            last_recovery_at: None,
            last_recovery_attempt_at: None,
            recovery_exhausted: false,
            hedge_miss_reported: None,
            harvest: HarvestProgress::new(harvest_levels),
            pending_close: None,
            close_reason: None,
            closed_at: None,
        };
        instance.transition(TriangleState::Open, now, "layer 0 filled");
        instance
    }

    // -- Legs -----------------------------------------------------------------

    pub fn legs(&self) -> impl Iterator<Item = &Leg> {
        self.layers.iter().flat_map(|l| l.legs.iter())
    }

    pub fn legs_mut(&mut self) -> impl Iterator<Item = &mut Leg> {
        self.layers.iter_mut().flat_map(|l| l.legs.iter_mut())
    }

    pub fn live_legs(&self) -> impl Iterator<Item = &Leg> {
        self.legs().filter(|l| !l.is_flat())
    }

    pub fn leg_mut(&mut self, position_id: &str) -> Option<&mut Leg> {
        self.legs_mut().find(|l| l.id == position_id)
    }

    pub fn is_flat(&self) -> bool {
        self.legs().all(|l| l.is_flat())
    }

    pub fn open_lots(&self) -> Decimal {
        self.live_legs().map(|l| l.volume).sum()
    }

    /// Live leg with the lowest floating profit.
    pub fn losing_leg(&self) -> Option<&Leg> {
        self.live_legs().min_by(|a, b| a.floating_profit.cmp(&b.floating_profit))
    }

    pub fn current_layer(&self) -> &Layer {
        // layer 0 is created in `open` and layers are never removed
        &self.layers[self.layers.len() - 1]
    }

    /// Number of recovery layers (layer 0 excluded).
    pub fn recovery_layers(&self) -> usize {
        self.layers.len().saturating_sub(1)
    }

    pub fn live_recovery_legs(&self) -> impl Iterator<Item = &Leg> {
        self.layers.iter().skip(1).flat_map(|l| l.legs.iter()).filter(|l| !l.is_flat())
    }

    pub fn has_live_recovery_legs(&self) -> bool {
        self.live_recovery_legs().next().is_some()
    }

    /// Floating profit of the live hedges plus the live legs they hedge,
    /// each hedged leg counted once.
    pub fn recovery_profit(&self) -> Decimal {
        let hedged: HashSet<&str> = self.layers.iter().skip(1).filter_map(|l| l.hedged.as_deref()).collect();
        let hedged_profit: Decimal = self
            .live_legs()
            .filter(|l| l.layer == 0 && hedged.contains(l.id.as_str()))
            .map(|l| l.floating_profit)
            .sum();
        hedged_profit + self.live_recovery_legs().map(|l| l.floating_profit).sum::<Decimal>()
    }

    // -- Marking --------------------------------------------------------------

    /// Re-mark every live leg. If any live leg has no fresh quote nothing
    /// is touched and `StaleQuote` is returned.
    pub fn mark(&mut self, book: &QuoteBook, pip_value_per_lot: Decimal) -> Result<(), EngineError> {
        for leg in self.live_legs() {
            book.require(&leg.symbol)?;
        }
        for leg in self.legs_mut().filter(|l| !l.is_flat()) {
            if let Some(quote) = book.get(&leg.symbol) {
                leg.mark(quote, pip_value_per_lot);
            }
        }
        self.recompute_aggregate();
        Ok(())
    }

    /// Σ floating profit over every leg of every layer.
    pub fn leg_sum(&self) -> Decimal {
        self.legs().map(|l| l.floating_profit).sum()
    }

    /// Recompute the cached aggregate.
    ///
    /// Money is the plain sum over legs. Pips are expressed in base-lot
    /// equivalents: each live leg's pips weighted by its fill volume over
    /// `base_volume`, so partial closes do not shrink the price distance the
    /// thresholds read.
    pub fn recompute_aggregate(&mut self) {
        self.aggregate_profit = self.leg_sum();
        self.aggregate_pips = if self.base_volume > Decimal::ZERO {
            self.live_legs()
                .map(|l| l.floating_pips * l.initial_volume / self.base_volume)
                .sum()
        } else {
            Decimal::ZERO
        };
    }

    /// Compare every live leg with the broker's view of its position.
    ///
    /// The broker wins: a leg whose position is gone goes flat, a volume
    /// mismatch takes the broker's volume, and when the floating profit over
    /// the live legs diverges by more than `PNL_TOLERANCE` every leg takes the
    /// broker's figure. The aggregate is recomputed after any change.
    pub fn reconcile(&mut self, positions: &HashMap<String, BrokerPosition>) -> Reconciliation {
        let mut result = Reconciliation::default();

        for leg in self.legs_mut().filter(|l| !l.is_flat()) {
            let broker_volume = positions.get(&leg.id).map(|p| p.volume).unwrap_or(Decimal::ZERO);
            if broker_volume != leg.volume {
                result.volumes.push((leg.id.clone(), leg.volume, broker_volume));
                leg.floating_profit = if leg.volume > Decimal::ZERO {
                    leg.floating_profit * broker_volume / leg.volume
                } else {
                    Decimal::ZERO
                };
                leg.volume = broker_volume;
                if leg.is_flat() {
                    leg.floating_pips = Decimal::ZERO;
                }
            }
        }

        let tracked: Decimal = self.live_legs().map(|l| l.floating_profit).sum();
        let broker: Decimal = self
            .live_legs()
            .filter_map(|l| positions.get(&l.id))
            .map(|p| p.floating_pnl)
            .sum();
        if (tracked - broker).abs() > PNL_TOLERANCE {
            result.pnl = Some((tracked, broker));
            for leg in self.legs_mut().filter(|l| !l.is_flat()) {
                if let Some(p) = positions.get(&leg.id) {
                    leg.floating_profit = p.floating_pnl;
                }
            }
        }

        if !result.is_clean() {
            self.recompute_aggregate();
        }
        result
    }

    /// Book a (partial) close of `position_id`.
    pub fn apply_close(&mut self, position_id: &str, closed_volume: Decimal, realized: Decimal, pip_value_per_lot: Decimal) {
        if let Some(leg) = self.leg_mut(position_id) {
            leg.volume = (leg.volume - closed_volume).max(Decimal::ZERO);
            leg.realized_profit += realized;
            leg.floating_profit = if leg.is_flat() {
                Decimal::ZERO
            } else {
                leg.floating_pips * leg.volume * pip_value_per_lot
            };
            if leg.is_flat() {
                leg.floating_pips = Decimal::ZERO;
            }
        }
        self.realized_profit += realized;
        self.recompute_aggregate();
    }

    // -- Layers ---------------------------------------------------------------

    /// Attach a filled recovery layer hedging the leg `hedged`. Resets harvest
    /// progress.
    pub fn push_layer(
        &mut self,
        fills: &[LegFill],
        correlation: Vec<(String, f64)>,
        hedged: &str,
        harvest_levels: usize,
        now: DateTime<Utc>,
    ) -> u32 {
        let number = self.layers.len() as u32;
        let legs: Vec<Leg> = fills.iter().map(|f| leg_from_fill(f, &self.id, number, now)).collect();
        let starting_volume = legs.iter().map(|l| l.volume).sum();
        self.layers.push(Layer {
            number,
            legs,
            opened_at: now,
            starting_volume,
            correlation,
            hedged: Some(hedged.to_string()),
        });
        self.first_recovery_at.get_or_insert(now);
        self.last_recovery_at = Some(now);
        self.last_recovery_attempt_at = Some(now);
        self.harvest = HarvestProgress::new(harvest_levels);
        self.transition(TriangleState::Recovering, now, &format!("recovery layer {number} opened"));
        number
    }

    // -- State ----------------------------------------------------------------

    /// Move to `to`, recording the transition. Returns the previous state,
    /// or `None` when already in `to`.
    pub fn transition(&mut self, to: TriangleState, at: DateTime<Utc>, reason: &str) -> Option<TriangleState> {
        let from = self.state;
        if from == to {
            return None;
        }
        info!(triangle = %self.id, %from, %to, reason, "State transition");
        self.transitions.push(StateTransition {
            from,
            to,
            at,
            reason: reason.to_string(),
        });
        self.state = to;
        Some(from)
    }

    /// State to return to after harvesting: `Recovering` while any recovery
    /// leg is live, else `Open`.
    pub fn resting_state(&self) -> TriangleState {
        if self.has_live_recovery_legs() {
            TriangleState::Recovering
        } else {
            TriangleState::Open
        }
    }

    pub fn mark_closed(&mut self, reason: CloseReason, at: DateTime<Utc>) {
        self.pending_close = None;
        self.close_reason = Some(reason);
        self.closed_at = Some(at);
        self.aggregate_profit = Decimal::ZERO;
        self.aggregate_pips = Decimal::ZERO;
        self.transition(TriangleState::Closed, at, &reason.to_string());
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.opened_at
    }
}

fn leg_from_fill(fill: &LegFill, triangle_id: &str, layer: u32, now: DateTime<Utc>) -> Leg {
    Leg {
        id: fill.position_id.clone(),
        symbol: fill.symbol.clone(),
        direction: fill.direction,
        volume: fill.volume,
        initial_volume: fill.volume,
        open_price: fill.price,
        triangle_id: triangle_id.to_string(),
        layer,
        floating_pips: Decimal::ZERO,
        floating_profit: Decimal::ZERO,
        realized_profit: Decimal::ZERO,
        opened_at: now,
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Arena of live triangle instances keyed by id, plus recent history.
#[derive(Debug)]
pub struct TriangleRegistry {
    live: BTreeMap<String, TriangleInstance>,
    history: VecDeque<TriangleInstance>,
    history_limit: usize,
}

impl TriangleRegistry {
    pub fn new(history_limit: usize) -> Self {
        Self {
            live: BTreeMap::new(),
            history: VecDeque::new(),
            history_limit,
        }
    }

    pub fn insert(&mut self, instance: TriangleInstance) {
        self.live.insert(instance.id.clone(), instance);
    }

    pub fn get(&self, id: &str) -> Option<&TriangleInstance> {
        self.live.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut TriangleInstance> {
        self.live.get_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &TriangleInstance> {
        self.live.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut TriangleInstance> {
        self.live.values_mut()
    }

    /// The live instance for a definition, if any.
    pub fn by_definition(&self, definition_id: &str) -> Option<&TriangleInstance> {
        self.live.values().find(|t| t.definition.id == definition_id)
    }

    /// Move closed instances into history. Returns them for bookkeeping.
    pub fn archive_closed(&mut self) -> Vec<TriangleInstance> {
        let closed: Vec<String> = self
            .live
            .values()
            .filter(|t| t.state.is_terminal())
            .map(|t| t.id.clone())
            .collect();
        let mut archived = Vec::with_capacity(closed.len());
        for id in closed {
            if let Some(instance) = self.live.remove(&id) {
                if self.history.len() == self.history_limit {
                    self.history.pop_front();
                }
                if self.history_limit > 0 {
                    self.history.push_back(instance.clone());
                }
                archived.push(instance);
            }
        }
        archived
    }

    /// Closed instances, most recent first.
    pub fn history(&self) -> impl Iterator<Item = &TriangleInstance> {
        self.history.iter().rev()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
