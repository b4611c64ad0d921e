//! Strategy helpers: lot sizing and exposure/margin risk management.
//!
//! Neither module issues orders. The engine asks `LotSizer` how large a
//! unit should be and asks `RiskManager` whether it may be opened.

pub mod risk;
pub mod sizing;

pub use risk::{OrphanExposure, RiskManager};
pub use sizing::LotSizer;
