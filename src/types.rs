//! Shared types for the HELIX engine.
//!
//! These types form the data model used across all modules.
//! They are designed to be stable so that broker, market, strategy,
//! and engine modules can depend on them without circular references.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Symbols & pips
// ---------------------------------------------------------------------------

/// Split a six-letter FX symbol (`EURUSD`) into `(base, quote)`.
///
/// Broker suffixes after the first six characters (`EURUSD.raw`) are ignored.
pub fn split_symbol(symbol: &str) -> Option<(&str, &str)> {
    if symbol.len() < 6 || !symbol.is_char_boundary(6) {
        return None;
    }
    let (base, rest) = symbol.split_at(3);
    let quote = &rest[..3];
    if base.chars().all(|c| c.is_ascii_alphabetic()) && quote.chars().all(|c| c.is_ascii_alphabetic()) {
        Some((base, quote))
    } else {
        None
    }
}

/// Pip size for a symbol: 0.01 for JPY-quoted pairs, 0.0001 otherwise.
pub fn pip_size(symbol: &str) -> Decimal {
    match split_symbol(symbol) {
        Some((_, "JPY")) => dec!(0.01),
        _ => dec!(0.0001),
    }
}

/// Convert a raw price difference into pips for `symbol`.
pub fn to_pips(symbol: &str, price_diff: Decimal) -> Decimal {
    price_diff / pip_size(symbol)
}

// ---------------------------------------------------------------------------
// Quotes
// ---------------------------------------------------------------------------

/// Top-of-book quote for one symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Quote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{} @ {}", self.symbol, self.bid, self.ask, self.timestamp.format("%H:%M:%S%.3f"))
    }
}

impl Quote {
    pub fn new(symbol: &str, bid: Decimal, ask: Decimal, timestamp: DateTime<Utc>) -> Self {
        Self {
            symbol: symbol.to_string(),
            bid,
            ask,
            timestamp,
        }
    }

    pub fn mid(&self) -> Decimal {
        (self.bid + self.ask) / dec!(2)
    }

    /// Spread expressed in pips of this symbol.
    pub fn spread_pips(&self) -> Decimal {
        to_pips(&self.symbol, self.ask - self.bid)
    }

    /// Price at which a position in `direction` would be closed right now.
    pub fn exit_price(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Buy => self.bid,
            Direction::Sell => self.ask,
        }
    }

    /// Price at which a new position in `direction` would be filled right now.
    pub fn entry_price(&self, direction: Direction) -> Decimal {
        match direction {
            Direction::Buy => self.ask,
            Direction::Sell => self.bid,
        }
    }

    /// Whether the quote is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.timestamp > max_age
    }

    /// A crossed or non-positive book is never tradable.
    pub fn is_sane(&self) -> bool {
        self.bid > Decimal::ZERO && self.ask >= self.bid
    }
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Trade direction of a leg.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// The opposite direction.
    pub fn opposite(&self) -> Self {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }

    /// +1 for buys, -1 for sells.
    pub fn sign(&self) -> Decimal {
        match self {
            Direction::Buy => Decimal::ONE,
            Direction::Sell => Decimal::NEGATIVE_ONE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// Lifecycle state of a triangle instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriangleState {
    Scanning,
    Open,
    Recovering,
    Harvesting,
    Closed,
}

impl TriangleState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TriangleState::Closed)
    }
}

impl fmt::Display for TriangleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriangleState::Scanning => write!(f, "Scanning"),
            TriangleState::Open => write!(f, "Open"),
            TriangleState::Recovering => write!(f, "Recovering"),
            TriangleState::Harvesting => write!(f, "Harvesting"),
            TriangleState::Closed => write!(f, "Closed"),
        }
    }
}

/// Why a triangle instance was closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    FinalTarget,
    TrailingStop,
    EmergencyStop,
    RecoveryTimeout,
    MaxAge,
    Manual,
    /// Operator-triggered close of every live triangle.
    CloseAll,
    /// Every leg was found closed at the broker.
    External,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::FinalTarget => write!(f, "final target"),
            CloseReason::TrailingStop => write!(f, "trailing stop"),
            CloseReason::EmergencyStop => write!(f, "emergency stop"),
            CloseReason::RecoveryTimeout => write!(f, "recovery timeout"),
            CloseReason::MaxAge => write!(f, "max age"),
            CloseReason::Manual => write!(f, "manual"),
            CloseReason::CloseAll => write!(f, "close all"),
            CloseReason::External => write!(f, "closed at broker"),
        }
    }
}

// ---------------------------------------------------------------------------
// Positions
// ---------------------------------------------------------------------------

/// One live position (leg) owned by a triangle instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Leg {
    /// Client-assigned id, also used as the broker position id.
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    /// Remaining open volume in lots (reduced on partial close).
    pub volume: Decimal,
    /// Volume at fill.
    pub initial_volume: Decimal,
    pub open_price: Decimal,
    pub triangle_id: String,
    /// 0 = original triangle, 1..N = recovery layers.
    pub layer: u32,
    #[serde(default)]
    pub floating_pips: Decimal,
    #[serde(default)]
    pub floating_profit: Decimal,
    #[serde(default)]
    pub realized_profit: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl fmt::Display for Leg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sign = if self.floating_profit >= Decimal::ZERO { "+" } else { "" };
        write!(
            f,
            "L{} {} {} {} lots @ {} ({sign}{:.1} pips, {sign}{:.2})",
            self.layer,
            self.direction,
            self.symbol,
            self.volume,
            self.open_price,
            self.floating_pips,
            self.floating_profit,
        )
    }
}

impl Leg {
    pub fn is_flat(&self) -> bool {
        self.volume <= Decimal::ZERO
    }

    /// Re-mark the leg against `quote`. Returns the new floating profit.
    pub fn mark(&mut self, quote: &Quote, pip_value_per_lot: Decimal) -> Decimal {
        let exit = quote.exit_price(self.direction);
        self.floating_pips = to_pips(&self.symbol, (exit - self.open_price) * self.direction.sign());
        self.floating_profit = self.floating_pips * self.volume * pip_value_per_lot;
        self.floating_profit
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain error taxonomy for the engine.
///
/// None of these are fatal to the process: each degrades the behaviour of a
/// single triangle or a single cycle.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Stale or missing quote for {symbol}")]
    StaleQuote { symbol: String },

    #[error("Execution incomplete: {filled}/{required} legs filled ({reason})")]
    ExecutionIncomplete {
        filled: usize,
        required: usize,
        reason: String,
    },

    #[error("Broker timeout on {symbol}")]
    BrokerTimeout { symbol: String },

    #[error("Recovery exhausted for {triangle_id}: {layers} layers open")]
    RecoveryExhausted { triangle_id: String, layers: usize },

    #[error("Margin insufficient: need {required:.2}, have {available:.2}")]
    MarginInsufficient { required: Decimal, available: Decimal },

    #[error("Exposure limit: {requested} lots requested, {open} open, limit {limit}")]
    ExposureLimit {
        requested: Decimal,
        open: Decimal,
        limit: Decimal,
    },

    #[error("Opportunity on {triangle_id} no longer ready ({net_pips} net pips)")]
    NotReady { triangle_id: String, net_pips: Decimal },

    #[error("Triangle {0} already has an open position")]
    DuplicateTriangle(String),

    #[error("Open triangle limit reached ({0})")]
    TriangleLimit(usize),

    #[error("No correlated hedge available for {0}")]
    NoCorrelatedHedge(String),

    #[error("Close rejected for {position_id}: {reason}")]
    CloseRejected { position_id: String, reason: String },

    #[error("Broker unavailable: order issuance suspended")]
    BrokerUnavailable,

    #[error("Triangle not found: {0}")]
    TriangleNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Errors that only ever get logged and never surface to the operator.
    pub fn is_absorbed(&self) -> bool {
        matches!(self, EngineError::StaleQuote { .. })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
