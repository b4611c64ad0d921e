//! HELIX: triangular FX arbitrage engine.
//!
//! Detects synthetic cross-rate dislocations across currency triangles,
//! opens all three legs as one unit, heals losing triangles with
//! correlation-driven recovery layers and takes profit in levels.
//!
//! Library crate exposing all modules for use by integration tests
//! and the binary entry point.

pub mod config;
pub mod types;
pub mod clock;
pub mod broker;
pub mod market;
pub mod strategy;
pub mod engine;
pub mod storage;
pub mod dashboard;
