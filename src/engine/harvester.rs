//! Profit harvester.
//!
//! Two policies, chosen by `harvest.mode`:
//!
//! - **levels**: ascending pip thresholds, each closing a percentage of the
//!   current layer's starting volume. A level fires at most once per layer.
//!   The last level closes everything and ends the triangle.
//! - **trailing**: once the peak aggregate reaches the activation level, a
//!   stop trails the peak at a distance that tightens as the peak grows. A
//!   pullback to the stop closes everything.
//!
//! Partial closes go to the legs currently in profit (`contributing`) or to
//! every live leg (`all_legs`), proportionally. Each leg's share is rounded
//! to the lot step; a share that rounds to zero leaves the leg alone and a
//! remainder below the minimum lot closes the whole leg.
//!
//! A close-all that leaves legs open is remembered on the instance and
//! retried on every later tick until the triangle is flat.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus};
use super::executor::UnitExecutor;
use super::tracker::TriangleInstance;
use crate::config::{HarvestConfig, HarvestMode, HarvestScope};
use crate::strategy::{LotSizer, RiskManager};
use crate::types::{CloseReason, EngineError, TriangleState};

#[derive(Debug, Clone, PartialEq)]
pub enum HarvestDecision {
    Idle,
    Harvested { levels: Vec<String> },
    Closed(CloseReason),
    Failed(EngineError),
}

pub struct ProfitHarvester {
    config: HarvestConfig,
    executor: Arc<UnitExecutor>,
    sizer: Arc<LotSizer>,
    risk: Arc<RiskManager>,
    pip_value_per_lot: Decimal,
}

impl ProfitHarvester {
    pub fn new(
        config: HarvestConfig,
        executor: Arc<UnitExecutor>,
        sizer: Arc<LotSizer>,
        risk: Arc<RiskManager>,
        pip_value_per_lot: Decimal,
    ) -> Self {
        Self {
            config,
            executor,
            sizer,
            risk,
            pip_value_per_lot,
        }
    }

    pub fn level_count(&self) -> usize {
        self.config.levels.len()
    }

    pub async fn evaluate(&self, inst: &mut TriangleInstance, events: &EventBus, now: DateTime<Utc>) -> HarvestDecision {
        match self.config.mode {
            HarvestMode::Levels => self.evaluate_levels(inst, events, now).await,
            HarvestMode::Trailing => self.evaluate_trailing(inst, events, now).await,
        }
    }

    // -- Levels ---------------------------------------------------------------

    async fn evaluate_levels(&self, inst: &mut TriangleInstance, events: &EventBus, now: DateTime<Utc>) -> HarvestDecision {
        if inst.aggregate_pips <= Decimal::ZERO || self.config.levels.is_empty() {
            return HarvestDecision::Idle;
        }
        if inst.harvest.fired.len() != self.config.levels.len() {
            inst.harvest.fired.resize(self.config.levels.len(), false);
        }

        let crossed: Vec<usize> = self
            .config
            .levels
            .iter()
            .enumerate()
            .filter(|(i, level)| !inst.harvest.fired[*i] && inst.aggregate_pips >= level.pips)
            .map(|(i, _)| i)
            .collect();
        let Some(&highest) = crossed.last() else {
            return HarvestDecision::Idle;
        };

        let last = self.config.levels.len() - 1;
        let trigger = &self.config.levels[highest];
        if inst
            .transition(TriangleState::Harvesting, now, &format!("level {} reached", trigger.name))
            .is_none()
        {
            return HarvestDecision::Idle;
        }

        if highest == last {
            info!(triangle = %inst.id, level = %trigger.name, pips = %inst.aggregate_pips.round_dp(1), "Final target reached");
            return match self.close_all(inst, CloseReason::FinalTarget, events, now).await {
                Ok(()) => {
                    inst.harvest.fired.iter_mut().for_each(|f| *f = true);
                    HarvestDecision::Closed(CloseReason::FinalTarget)
                }
                Err(e) => {
                    let resting = inst.resting_state();
                    inst.transition(resting, now, "final close incomplete");
                    HarvestDecision::Failed(e)
                }
            };
        }

        let mut fired = Vec::new();
        let mut failure = None;
        for idx in crossed {
            let level = &self.config.levels[idx];
            let remaining = dec!(100) - inst.harvest.closed_pct;
            let fraction = if remaining > Decimal::ZERO {
                (level.percent / remaining).min(Decimal::ONE)
            } else {
                Decimal::ONE
            };

            match self.close_fraction(inst, fraction, &level.name, events, now).await {
                Ok(()) => {
                    inst.harvest.fired[idx] = true;
                    inst.harvest.closed_pct += level.percent;
                    fired.push(level.name.clone());
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if inst.is_flat() {
            inst.mark_closed(CloseReason::FinalTarget, now);
            self.finish_close(inst, CloseReason::FinalTarget, events, now);
            return HarvestDecision::Closed(CloseReason::FinalTarget);
        }
        let resting = inst.resting_state();
        inst.transition(resting, now, "harvest complete");

        match failure {
            Some(e) if fired.is_empty() => HarvestDecision::Failed(e),
            _ => HarvestDecision::Harvested { levels: fired },
        }
    }

    // -- Trailing -------------------------------------------------------------

    /// Current trailing distance for a peak.
    pub fn trailing_distance(&self, peak: Decimal) -> Decimal {
        let t = &self.config.trailing;
        let tightened = t.distance_pips - t.tighten_ratio * (peak - t.activation_pips).max(Decimal::ZERO);
        tightened.max(t.min_distance_pips)
    }

    async fn evaluate_trailing(&self, inst: &mut TriangleInstance, events: &EventBus, now: DateTime<Utc>) -> HarvestDecision {
        let pips = inst.aggregate_pips;
        let peak = match inst.harvest.peak_pips {
            Some(p) if p >= pips => p,
            _ => {
                if pips > Decimal::ZERO {
                    inst.harvest.peak_pips = Some(pips);
                }
                pips
            }
        };
        if peak < self.config.trailing.activation_pips {
            return HarvestDecision::Idle;
        }

        let stop = peak - self.trailing_distance(peak);
        if pips > stop {
            return HarvestDecision::Idle;
        }

        info!(triangle = %inst.id, peak = %peak.round_dp(1), stop = %stop.round_dp(1), pips = %pips.round_dp(1), "Trailing stop hit");
        if inst.transition(TriangleState::Harvesting, now, "trailing stop hit").is_none() {
            return HarvestDecision::Idle;
        }
        match self.close_all(inst, CloseReason::TrailingStop, events, now).await {
            Ok(()) => HarvestDecision::Closed(CloseReason::TrailingStop),
            Err(e) => {
                let resting = inst.resting_state();
                inst.transition(resting, now, "trailing close incomplete");
                HarvestDecision::Failed(e)
            }
        }
    }

    /// Retry a close-all that left legs open on an earlier tick. `None` when
    /// nothing is pending.
    pub async fn retry_pending_close(
        &self,
        inst: &mut TriangleInstance,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> Option<HarvestDecision> {
        let reason = inst.pending_close?;
        info!(triangle = %inst.id, %reason, legs = inst.live_legs().count(), "Retrying incomplete close");
        Some(match self.close_all(inst, reason, events, now).await {
            Ok(()) => HarvestDecision::Closed(reason),
            Err(e) => HarvestDecision::Failed(e),
        })
    }

    // -- Closing --------------------------------------------------------------

    /// Close `fraction` of every leg in scope. Succeeds if at least one leg
    /// was reduced or every share rounded to nothing.
    async fn close_fraction(
        &self,
        inst: &mut TriangleInstance,
        fraction: Decimal,
        level: &str,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let targets: Vec<(String, Decimal)> = inst
            .live_legs()
            .filter(|l| match self.config.scope {
                HarvestScope::Contributing => l.floating_profit > Decimal::ZERO,
                HarvestScope::AllLegs => true,
            })
            .map(|l| (l.id.clone(), l.volume))
            .collect();
        if targets.is_empty() {
            debug!(triangle = %inst.id, level, "No legs in harvest scope");
            return Ok(());
        }

        let mut realized_total = Decimal::ZERO;
        let mut closed = Vec::new();
        let mut attempted = 0;
        let mut first_error = None;
        for (position_id, volume) in targets {
            let Some(closed_volume) = self.harvest_volume(volume, fraction) else {
                debug!(triangle = %inst.id, position = %position_id, %volume, "Harvest share below one lot step");
                continue;
            };
            attempted += 1;
            let broker_fraction = if closed_volume == volume {
                Decimal::ONE
            } else {
                closed_volume / volume
            };
            match self.executor.close_position(&position_id, broker_fraction).await {
                Ok(realized) => {
                    inst.apply_close(&position_id, closed_volume, realized, self.pip_value_per_lot);
                    self.risk.release_lots(&inst.definition.id, closed_volume);
                    realized_total += realized;
                    closed.push(position_id);
                }
                Err(e) => {
                    self.report_close_failure(inst, &position_id, &e, events, now);
                    first_error.get_or_insert(e);
                }
            }
        }

        if attempted == 0 {
            return Ok(());
        }
        if closed.is_empty() {
            return Err(first_error.unwrap_or(EngineError::CloseRejected {
                position_id: inst.id.clone(),
                reason: "no leg closed".into(),
            }));
        }
        info!(triangle = %inst.id, level, %fraction, realized = %realized_total.round_dp(2), legs = closed.len(), "Harvest level executed");
        events.emit(
            now,
            EngineEvent::HarvestExecuted {
                triangle_id: inst.id.clone(),
                level: level.to_string(),
                fraction,
                realized: realized_total,
                closed_positions: closed,
            },
        );
        Ok(())
    }

    /// Lots to close from a leg of `volume` for `fraction`, on the lot step.
    /// `None` when the share rounds to zero; the whole leg when the remainder
    /// would fall below the minimum lot.
    pub fn harvest_volume(&self, volume: Decimal, fraction: Decimal) -> Option<Decimal> {
        let share = self.sizer.nearest_step(volume * fraction).min(volume);
        if share <= Decimal::ZERO {
            return None;
        }
        if volume - share < self.sizer.config().min_lot {
            return Some(volume);
        }
        Some(share)
    }

    /// Close every live leg. The instance reaches `Closed` only if every leg
    /// is flat afterwards; otherwise the first close error is returned, the
    /// remaining legs stay tracked and the close is left pending for retry.
    pub async fn close_all(
        &self,
        inst: &mut TriangleInstance,
        reason: CloseReason,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let targets: Vec<(String, Decimal)> = inst.live_legs().map(|l| (l.id.clone(), l.volume)).collect();
        let mut first_error = None;
        for (position_id, volume) in targets {
            match self.executor.close_position(&position_id, Decimal::ONE).await {
                Ok(realized) => {
                    inst.apply_close(&position_id, volume, realized, self.pip_value_per_lot);
                    self.risk.release_lots(&inst.definition.id, volume);
                }
                Err(e) => {
                    self.report_close_failure(inst, &position_id, &e, events, now);
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(e) = first_error {
            inst.pending_close = Some(reason);
            return Err(e);
        }
        inst.mark_closed(reason, now);
        self.finish_close(inst, reason, events, now);
        Ok(())
    }

    fn finish_close(&self, inst: &TriangleInstance, reason: CloseReason, events: &EventBus, now: DateTime<Utc>) {
        self.risk.release_triangle(&inst.definition.id);
        info!(triangle = %inst.id, %reason, realized = %inst.realized_profit.round_dp(2), "Triangle closed");
        events.emit(
            now,
            EngineEvent::TriangleClosed {
                triangle_id: inst.id.clone(),
                reason,
                realized_profit: inst.realized_profit,
            },
        );
    }

    fn report_close_failure(
        &self,
        inst: &TriangleInstance,
        position_id: &str,
        err: &EngineError,
        events: &EventBus,
        now: DateTime<Utc>,
    ) {
        warn!(triangle = %inst.id, position = position_id, error = %err, "Close failed");
        events.emit(
            now,
            EngineEvent::CloseFailed {
                triangle_id: inst.id.clone(),
                position_id: position_id.to_string(),
                reason: err.to_string(),
            },
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
