//! Recovery engine.
//!
//! When a triangle's aggregate loss crosses the threshold of its next layer
//! and the recovery delay has elapsed, opens hedge positions in symbols
//! strongly correlated with the losing leg. Each layer compounds the volume
//! of the previous one by `recovery_multiplier`, capped by free margin.
//!
//! Hedge direction follows the sign of the correlation so that the hedge
//! gains when the losing leg keeps losing:
//! - ρ > 0 (moves together): trade opposite to the losing leg.
//! - ρ < 0 (moves inversely): trade the same direction as the losing leg.
//!
//! Recovery completes once the live hedges together with the legs they hedge
//! show more than `completion_profit`: every recovery leg is closed and the
//! triangle returns to `Open`. Layer numbering carries on if the loss comes
//! back.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::events::{EngineEvent, EventBus};
use super::executor::{LegOrder, UnitExecutor};
use super::tracker::TriangleInstance;
use crate::config::RecoveryConfig;
use crate::market::{CorrelationTable, QuoteBook};
use crate::strategy::{LotSizer, RiskManager};
use crate::types::{Direction, EngineError, TriangleState};

/// What the recovery check did for one instance on one tick.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDecision {
    /// Loss not beyond the next layer's threshold (or recovery disabled).
    NotTriggered,
    /// Threshold crossed but the recovery delay has not elapsed.
    Waiting,
    Opened { layer: u32 },
    /// Every recovery leg closed in profit; back to `Open`.
    Completed { realized: Decimal },
    Exhausted,
    Failed(EngineError),
}

pub struct RecoveryEngine {
    config: RecoveryConfig,
    correlations: Arc<CorrelationTable>,
    sizer: Arc<LotSizer>,
    risk: Arc<RiskManager>,
    executor: Arc<UnitExecutor>,
    harvest_levels: usize,
    pip_value_per_lot: Decimal,
}

/// Hedge direction for a position correlated by `rho` with a leg trading `losing`.
pub fn hedge_direction(losing: Direction, rho: f64) -> Direction {
    if rho >= 0.0 {
        losing.opposite()
    } else {
        losing
    }
}

impl RecoveryEngine {
    pub fn new(
        config: RecoveryConfig,
        correlations: Arc<CorrelationTable>,
        sizer: Arc<LotSizer>,
        risk: Arc<RiskManager>,
        executor: Arc<UnitExecutor>,
        harvest_levels: usize,
        pip_value_per_lot: Decimal,
    ) -> Self {
        Self {
            config,
            correlations,
            sizer,
            risk,
            executor,
            harvest_levels,
            pip_value_per_lot,
        }
    }

    pub fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    pub async fn evaluate(
        &self,
        inst: &mut TriangleInstance,
        book: &QuoteBook,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> RecoveryDecision {
        if let Some(done) = self.try_complete(inst, events, now).await {
            return done;
        }
        if !self.config.enabled || inst.aggregate_pips >= Decimal::ZERO {
            return RecoveryDecision::NotTriggered;
        }

        let next = inst.recovery_layers() as u32 + 1;
        if inst.aggregate_pips > self.config.threshold_for(next) {
            return RecoveryDecision::NotTriggered;
        }

        if next > self.config.max_recovery_layers {
            if !inst.recovery_exhausted {
                inst.recovery_exhausted = true;
                events.emit(
                    now,
                    EngineEvent::RecoveryExhausted {
                        triangle_id: inst.id.clone(),
                        layers: inst.recovery_layers(),
                    },
                );
            }
            return RecoveryDecision::Exhausted;
        }

        if let Some(last) = inst.last_recovery_attempt_at {
            if now - last < self.config.recovery_delay() {
                debug!(triangle = %inst.id, layer = next, "Recovery delay not elapsed");
                return RecoveryDecision::Waiting;
            }
        }

        let Some(losing) = inst.losing_leg().cloned() else {
            return RecoveryDecision::NotTriggered;
        };

        // -- Hedge selection ------------------------------------------------
        let matrix = self.correlations.snapshot();
        let hedges: Vec<(String, f64)> = matrix
            .strongest_for(&losing.symbol, self.config.strong_correlation)
            .into_iter()
            .filter(|(symbol, _)| book.is_fresh(symbol))
            .take(self.config.hedges_per_layer)
            .collect();

        if hedges.is_empty() {
            let err = EngineError::NoCorrelatedHedge(losing.symbol.clone());
            if inst.hedge_miss_reported != Some(next) {
                inst.hedge_miss_reported = Some(next);
                events.emit(
                    now,
                    EngineEvent::RecoveryFailed {
                        triangle_id: inst.id.clone(),
                        layer: next,
                        error: err.to_string(),
                    },
                );
            }
            return RecoveryDecision::Failed(err);
        }

        // -- Sizing ---------------------------------------------------------
        let prior = if inst.recovery_layers() == 0 {
            inst.base_volume
        } else {
            let layer = inst.current_layer();
            layer.starting_volume / Decimal::from(layer.legs.len().max(1))
        };
        let mut volume = self.sizer.recovery_volume(prior, self.config.recovery_multiplier);
        let hedge_count = Decimal::from(hedges.len());

        let account = match self.executor.gateway().account().await {
            Ok(a) => a,
            Err(e) => return self.fail(inst, next, e, events, now),
        };
        let affordable = self.risk.affordable_lots(account.free_margin) / hedge_count;
        if volume > affordable {
            volume = self.sizer.floor_to_step(affordable);
            debug!(triangle = %inst.id, layer = next, %volume, "Recovery volume capped by margin");
        }
        if volume < self.sizer.config().min_lot {
            let err = EngineError::MarginInsufficient {
                required: self.risk.margin_required(self.sizer.config().min_lot * hedge_count),
                available: account.free_margin,
            };
            return self.fail(inst, next, err, events, now);
        }

        let total = volume * hedge_count;
        if let Err(e) = self.risk.try_add_lots(&inst.definition.id, total) {
            return self.fail(inst, next, e, events, now);
        }

        // -- Execution --------------------------------------------------------
        let orders: Vec<LegOrder> = hedges
            .iter()
            .map(|(symbol, rho)| LegOrder {
                symbol: symbol.clone(),
                direction: hedge_direction(losing.direction, *rho),
                volume,
            })
            .collect();

        let label = format!("{}:L{next}", inst.id);
        match self.executor.execute(&label, &orders).await {
            Ok(fills) => {
                let layer = inst.push_layer(&fills, hedges.clone(), &losing.id, self.harvest_levels, now);
                info!(
                    triangle = %inst.id,
                    layer,
                    losing = %losing.symbol,
                    hedges = hedges.len(),
                    %volume,
                    aggregate_pips = %inst.aggregate_pips.round_dp(1),
                    "Recovery layer opened"
                );
                events.emit(
                    now,
                    EngineEvent::RecoveryLayerOpened {
                        triangle_id: inst.id.clone(),
                        layer,
                        aggregate_pips: inst.aggregate_pips,
                        correlation: hedges,
                        legs: fills,
                    },
                );
                RecoveryDecision::Opened { layer }
            }
            Err(failure) => {
                self.risk.settle_failed_layer(&inst.definition.id, total, &failure.orphaned);
                for orphan in &failure.orphaned {
                    events.emit(now, EngineEvent::orphaned(&inst.definition.id, orphan));
                }
                self.fail(inst, next, failure.error, events, now)
            }
        }
    }

    /// Complete recovery if the live hedges and their hedged legs are in
    /// profit beyond `completion_profit`. `None` when there is nothing to
    /// complete.
    pub async fn try_complete(
        &self,
        inst: &mut TriangleInstance,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> Option<RecoveryDecision> {
        if !inst.has_live_recovery_legs() {
            return None;
        }
        let profit = inst.recovery_profit();
        if profit <= self.config.completion_profit {
            return None;
        }
        Some(self.complete(inst, profit, events, now).await)
    }

    /// Close every live recovery leg. Legs that fail to close stay live and
    /// the completion is attempted again next tick.
    async fn complete(
        &self,
        inst: &mut TriangleInstance,
        profit: Decimal,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> RecoveryDecision {
        let targets: Vec<(String, Decimal)> = inst.live_recovery_legs().map(|l| (l.id.clone(), l.volume)).collect();
        let mut realized = Decimal::ZERO;
        let mut first_error = None;
        for (position_id, volume) in targets {
            match self.executor.close_position(&position_id, Decimal::ONE).await {
                Ok(pnl) => {
                    inst.apply_close(&position_id, volume, pnl, self.pip_value_per_lot);
                    self.risk.release_lots(&inst.definition.id, volume);
                    realized += pnl;
                }
                Err(e) => {
                    warn!(triangle = %inst.id, position = %position_id, error = %e, "Recovery leg close failed");
                    events.emit(
                        now,
                        EngineEvent::CloseFailed {
                            triangle_id: inst.id.clone(),
                            position_id,
                            reason: e.to_string(),
                        },
                    );
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return RecoveryDecision::Failed(e);
        }

        let layers = inst.recovery_layers();
        inst.recovery_exhausted = false;
        inst.hedge_miss_reported = None;
        inst.transition(TriangleState::Open, now, "recovery complete");
        info!(
            triangle = %inst.id,
            layers,
            profit = %profit.round_dp(2),
            realized = %realized.round_dp(2),
            "Recovery complete"
        );
        events.emit(
            now,
            EngineEvent::RecoveryCompleted {
                triangle_id: inst.id.clone(),
                layers,
                realized,
            },
        );
        RecoveryDecision::Completed { realized }
    }

    /// Report a failed attempt and stamp it so the next one waits a full delay.
    fn fail(
        &self,
        inst: &mut TriangleInstance,
        layer: u32,
        err: EngineError,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> RecoveryDecision {
        warn!(triangle = %inst.id, layer, error = %err, "Recovery attempt failed");
        inst.last_recovery_attempt_at = Some(now);
        events.emit(
            now,
            EngineEvent::RecoveryFailed {
                triangle_id: inst.id.clone(),
                layer,
                error: err.to_string(),
            },
        );
        RecoveryDecision::Failed(err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
