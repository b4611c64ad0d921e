//! Broker capabilities.
//!
//! The engine depends only on these contracts, never on a concrete broker:
//! - `PriceFeed`: latest top-of-book quote per symbol.
//! - `OrderGateway`: order submission, (partial) closes, open positions and
//!   account margin.
//!
//! `paper` provides an in-memory implementation of both, used by the binary
//! and by the integration tests.

pub mod paper;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Direction, EngineError, Quote};

/// Source of the most recent quote for a symbol.
#[async_trait]
pub trait PriceFeed: Send + Sync {
    /// Latest quote, or `None` when the feed has nothing for `symbol`.
    /// `None` is staleness, never a zero price.
    async fn latest_quote(&self, symbol: &str) -> Option<Quote>;
}

/// A market order for one leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-assigned id; the broker uses it as the position id.
    pub client_id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub comment: String,
}

/// Result of a submit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    Filled { price: Decimal },
    Rejected { reason: String },
    Timeout,
}

impl SubmitOutcome {
    pub fn is_filled(&self) -> bool {
        matches!(self, SubmitOutcome::Filled { .. })
    }
}

/// Result of a close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CloseOutcome {
    Closed { realized_pnl: Decimal },
    Rejected { reason: String },
}

/// Account figures needed for margin checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub balance: Decimal,
    pub equity: Decimal,
    pub free_margin: Decimal,
}

/// A position as the broker reports it, marked at the broker's own prices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub floating_pnl: Decimal,
}

/// Order routing capability.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn submit(&self, order: &OrderRequest) -> SubmitOutcome;

    /// Close `fraction` (0, 1] of the remaining volume of `position_id`.
    async fn close(&self, position_id: &str, fraction: Decimal) -> CloseOutcome;

    async fn account(&self) -> Result<AccountInfo, EngineError>;

    /// Every open position held at the broker.
    async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError>;

    /// `false` on total disconnect: order issuance is suspended until it recovers.
    fn is_connected(&self) -> bool;

    /// Broker name for logging.
    fn name(&self) -> String;
}
