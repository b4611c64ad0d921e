//! Market data: the triangle catalog, per-tick quote collection and the
//! shared correlation table.

pub mod catalog;
pub mod correlation;
pub mod quotes;

pub use catalog::{ArbDirection, LegSpec, TriangleCatalog, TriangleDefinition};
pub use correlation::{CorrelationMatrix, CorrelationTable, ReturnsWindow};
pub use quotes::QuoteBook;
