//! Execution gate.
//!
//! Turns a ready opportunity into a layer-0 triangle instance. Checks run
//! in order: broker connected, opportunity still ready, duplicate entry,
//! open-triangle limit, lot exposure, margin. Exposure is reserved before
//! the three orders go out and released again if the unit does not fill,
//! except for legs the broker refused to reverse, which stay booked.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::events::{EngineEvent, EventBus};
use super::executor::{LegOrder, UnitExecutor};
use super::scanner::Opportunity;
use super::tracker::TriangleInstance;
use crate::market::{QuoteBook, TriangleDefinition};
use crate::strategy::{LotSizer, RiskManager};
use crate::types::EngineError;

pub struct ExecutionGate {
    executor: Arc<UnitExecutor>,
    sizer: Arc<LotSizer>,
    risk: Arc<RiskManager>,
    harvest_levels: usize,
}

impl ExecutionGate {
    pub fn new(executor: Arc<UnitExecutor>, sizer: Arc<LotSizer>, risk: Arc<RiskManager>, harvest_levels: usize) -> Self {
        Self {
            executor,
            sizer,
            risk,
            harvest_levels,
        }
    }

    /// Validate `opp` and open its three legs as one unit.
    ///
    /// Every outcome except a duplicate entry is reported on `events`.
    pub async fn open(
        &self,
        def: &TriangleDefinition,
        opp: &Opportunity,
        book: &QuoteBook,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> Result<TriangleInstance, EngineError> {
        let result = self.try_open(def, opp, book, events, now).await;
        if let Err(e) = &result {
            if !matches!(e, EngineError::DuplicateTriangle(_)) {
                warn!(triangle = %def.id, error = %e, "Execution gate rejected opportunity");
            }
            if !matches!(e, EngineError::DuplicateTriangle(_) | EngineError::ExecutionIncomplete { .. }) {
                events.emit(
                    now,
                    EngineEvent::ExecutionFailed {
                        definition_id: def.id.clone(),
                        error: e.to_string(),
                        reversed: Vec::new(),
                    },
                );
            }
        }
        result
    }

    async fn try_open(
        &self,
        def: &TriangleDefinition,
        opp: &Opportunity,
        book: &QuoteBook,
        events: &EventBus,
        now: DateTime<Utc>,
    ) -> Result<TriangleInstance, EngineError> {
        let gateway = self.executor.gateway();
        if !gateway.is_connected() {
            return Err(EngineError::BrokerUnavailable);
        }
        if !opp.ready {
            return Err(EngineError::NotReady {
                triangle_id: opp.triangle_id.clone(),
                net_pips: opp.net_pips,
            });
        }

        let lots = self.sizer.triangle_lots(def, book, &self.sizer.config().account_currency);
        let total: Decimal = lots.iter().copied().sum();
        self.risk.try_open_triangle(&def.id, total)?;

        let account = match gateway.account().await {
            Ok(a) => a,
            Err(e) => {
                self.risk.release_triangle(&def.id);
                return Err(e);
            }
        };
        if let Err(e) = self.risk.check_margin(total, account.free_margin) {
            self.risk.release_triangle(&def.id);
            return Err(e);
        }

        let orders: Vec<LegOrder> = def
            .leg_directions(opp.direction)
            .into_iter()
            .zip(lots)
            .map(|((symbol, direction), volume)| LegOrder {
                symbol,
                direction,
                volume,
            })
            .collect();

        let id = Uuid::new_v4().to_string();
        match self.executor.execute(&id, &orders).await {
            Ok(fills) => {
                let instance = TriangleInstance::open(
                    id,
                    def.clone(),
                    opp.direction,
                    opp.net_pips,
                    &fills,
                    self.harvest_levels,
                    now,
                );
                info!(
                    triangle = %instance.id,
                    definition = %def.id,
                    direction = %opp.direction,
                    net_pips = %opp.net_pips.round_dp(2),
                    lots = %total,
                    "Triangle opened"
                );
                events.emit(
                    now,
                    EngineEvent::TriangleOpened {
                        triangle_id: instance.id.clone(),
                        definition_id: def.id.clone(),
                        direction: opp.direction,
                        net_pips: opp.net_pips,
                        legs: fills,
                    },
                );
                Ok(instance)
            }
            Err(failure) => {
                self.risk.settle_failed_entry(&def.id, &failure.orphaned);
                for orphan in &failure.orphaned {
                    events.emit(now, EngineEvent::orphaned(&def.id, orphan));
                }
                events.emit(
                    now,
                    EngineEvent::ExecutionFailed {
                        definition_id: def.id.clone(),
                        error: failure.error.to_string(),
                        reversed: failure.reversed,
                    },
                );
                Err(failure.error)
            }
        }
    }
}
