//! Unit executor.
//!
//! Submits a set of legs as one logical unit: either every leg fills, or
//! every filled leg is reversed before control returns. Each submit is
//! bounded by the fill timeout; a timeout is a hard cancellation point and is
//! never retried here.

use futures::future::join_all;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::events::LegFill;
use crate::broker::{CloseOutcome, OrderGateway, OrderRequest, SubmitOutcome};
use crate::types::{Direction, EngineError};

// ---------------------------------------------------------------------------
// Execution result
// ---------------------------------------------------------------------------

/// One leg to be opened.
#[derive(Debug, Clone, PartialEq)]
pub struct LegOrder {
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
}

/// A filled leg whose reversal the broker rejected.
#[derive(Debug, Clone, PartialEq)]
pub struct OrphanedFill {
    pub position_id: String,
    pub symbol: String,
    pub volume: Decimal,
    pub reason: String,
}

/// Why a unit did not open. No leg of the unit is left open unless it is
/// listed in `orphaned`.
#[derive(Debug, Clone)]
pub struct UnitFailure {
    pub error: EngineError,
    /// Filled legs that were closed again.
    pub reversed: Vec<String>,
    pub orphaned: Vec<OrphanedFill>,
}

impl UnitFailure {
    pub fn orphaned_volume(&self) -> Decimal {
        self.orphaned.iter().map(|o| o.volume).sum()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct UnitExecutor {
    gateway: Arc<dyn OrderGateway>,
    fill_timeout: Duration,
}

impl UnitExecutor {
    pub fn new(gateway: Arc<dyn OrderGateway>, fill_timeout: Duration) -> Self {
        Self { gateway, fill_timeout }
    }

    pub fn gateway(&self) -> &Arc<dyn OrderGateway> {
        &self.gateway
    }

    /// Open every leg in `orders` or none of them.
    pub async fn execute(&self, label: &str, orders: &[LegOrder]) -> Result<Vec<LegFill>, UnitFailure> {
        let requests: Vec<OrderRequest> = orders
            .iter()
            .map(|o| OrderRequest {
                client_id: Uuid::new_v4().to_string(),
                symbol: o.symbol.clone(),
                direction: o.direction,
                volume: o.volume,
                comment: label.to_string(),
            })
            .collect();

        debug!(unit = label, legs = requests.len(), "Submitting unit");
        let outcomes = join_all(requests.iter().map(|req| self.submit_bounded(req))).await;

        let mut fills = Vec::with_capacity(requests.len());
        let mut problems = Vec::new();
        let mut timed_out = Vec::new();
        for (req, outcome) in requests.iter().zip(outcomes) {
            match outcome {
                SubmitOutcome::Filled { price } => fills.push(LegFill {
                    position_id: req.client_id.clone(),
                    symbol: req.symbol.clone(),
                    direction: req.direction,
                    volume: req.volume,
                    price,
                }),
                SubmitOutcome::Rejected { reason } => problems.push(format!("{} rejected: {reason}", req.symbol)),
                SubmitOutcome::Timeout => {
                    problems.push(
                        EngineError::BrokerTimeout {
                            symbol: req.symbol.clone(),
                        }
                        .to_string(),
                    );
                    timed_out.push(req.client_id.clone());
                }
            }
        }

        if fills.len() == requests.len() {
            info!(unit = label, legs = fills.len(), "Unit filled");
            return Ok(fills);
        }

        warn!(
            unit = label,
            filled = fills.len(),
            required = requests.len(),
            problems = %problems.join("; "),
            "Unit incomplete, reversing filled legs"
        );
        let mut failure = UnitFailure {
            error: EngineError::ExecutionIncomplete {
                filled: fills.len(),
                required: requests.len(),
                reason: problems.join("; "),
            },
            reversed: Vec::new(),
            orphaned: Vec::new(),
        };

        for fill in &fills {
            match self.close_position(&fill.position_id, Decimal::ONE).await {
                Ok(_) => failure.reversed.push(fill.position_id.clone()),
                Err(e) => failure.orphaned.push(OrphanedFill {
                    position_id: fill.position_id.clone(),
                    symbol: fill.symbol.clone(),
                    volume: fill.volume,
                    reason: e.to_string(),
                }),
            }
        }
        // A timed-out order may still have filled on the broker side.
        for id in &timed_out {
            if self.close_position(id, Decimal::ONE).await.is_ok() {
                failure.reversed.push(id.clone());
            }
        }
        Err(failure)
    }

    async fn submit_bounded(&self, req: &OrderRequest) -> SubmitOutcome {
        match tokio::time::timeout(self.fill_timeout, self.gateway.submit(req)).await {
            Ok(outcome) => outcome,
            Err(_) => SubmitOutcome::Timeout,
        }
    }

    /// Close `fraction` of a position. Returns realized P&L.
    pub async fn close_position(&self, position_id: &str, fraction: Decimal) -> Result<Decimal, EngineError> {
        let outcome = tokio::time::timeout(self.fill_timeout, self.gateway.close(position_id, fraction)).await;
        match outcome {
            Ok(CloseOutcome::Closed { realized_pnl }) => Ok(realized_pnl),
            Ok(CloseOutcome::Rejected { reason }) => Err(EngineError::CloseRejected {
                position_id: position_id.to_string(),
                reason,
            }),
            Err(_) => Err(EngineError::CloseRejected {
                position_id: position_id.to_string(),
                reason: "close timed out".to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
