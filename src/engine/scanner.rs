//! Opportunity scanner.
//!
//! For each triangle, multiplies the two synthetic legs into an implied
//! cross rate and compares it to the quoted cross. The deviation in cross
//! pips, less the spreads of all three legs, is the net profit estimate.
//!
//! Results land on an `OpportunityBoard` keyed by triangle: the latest scan
//! always overwrites, and the board is cleared once a cycle has consumed it.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

use crate::config::TradingConfig;
use crate::market::{ArbDirection, LegSpec, QuoteBook, TriangleCatalog, TriangleDefinition};
use crate::types::{pip_size, EngineError};

// ---------------------------------------------------------------------------
// Opportunity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    /// Triangle definition id.
    pub triangle_id: String,
    pub direction: ArbDirection,
    pub synthetic: Decimal,
    pub cross_bid: Decimal,
    pub cross_ask: Decimal,
    /// Distance from the synthetic rate to the tradable cross price, in
    /// cross pips. Negative when the synthetic sits inside the cross spread.
    pub deviation_pips: Decimal,
    pub spread_cost_pips: Decimal,
    pub net_pips: Decimal,
    /// Ranking only: net relative to twice the minimum, clamped to [0, 1].
    pub confidence: f64,
    pub ready: bool,
    pub detected_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Scanner
// ---------------------------------------------------------------------------

pub struct Scanner {
    min_profit: Decimal,
    max_spread_cost: Decimal,
}

/// Outcome of one scan cycle.
#[derive(Debug, Default)]
pub struct ScanReport {
    pub scanned: usize,
    pub ready: usize,
    /// Triangles skipped this cycle because a quote was stale or missing.
    pub skipped: Vec<(String, EngineError)>,
}

impl Scanner {
    pub fn new(config: &TradingConfig) -> Self {
        Self {
            min_profit: config.min_arbitrage_profit,
            max_spread_cost: config.max_spread_cost,
        }
    }

    fn rate(spec: &LegSpec, book: &QuoteBook) -> Result<Decimal, EngineError> {
        let mid = book.require(&spec.symbol)?.mid();
        if spec.inverted {
            if mid.is_zero() {
                return Err(EngineError::StaleQuote {
                    symbol: spec.symbol.clone(),
                });
            }
            Ok(Decimal::ONE / mid)
        } else {
            Ok(mid)
        }
    }

    /// Evaluate one triangle against the current book.
    pub fn evaluate(
        &self,
        def: &TriangleDefinition,
        book: &QuoteBook,
        now: DateTime<Utc>,
    ) -> Result<Opportunity, EngineError> {
        let cross = book.require(&def.cross.symbol)?;
        let synthetic = Self::rate(&def.first, book)? * Self::rate(&def.second, book)?;
        let pip = pip_size(&def.cross.symbol);

        let (direction, deviation_pips) = if synthetic > cross.ask {
            (ArbDirection::Forward, (synthetic - cross.ask) / pip)
        } else if synthetic < cross.bid {
            (ArbDirection::Reverse, (cross.bid - synthetic) / pip)
        } else if synthetic >= cross.mid() {
            (ArbDirection::Forward, (synthetic - cross.ask) / pip)
        } else {
            (ArbDirection::Reverse, (cross.bid - synthetic) / pip)
        };

        let mut spread_cost_pips = Decimal::ZERO;
        for symbol in def.symbols() {
            spread_cost_pips += book.require(symbol)?.spread_pips();
        }

        let net_pips = deviation_pips - spread_cost_pips;
        let ready = net_pips >= self.min_profit && spread_cost_pips <= self.max_spread_cost;
        let confidence = if self.min_profit > Decimal::ZERO {
            (net_pips / (dec!(2) * self.min_profit)).to_f64().unwrap_or(0.0).clamp(0.0, 1.0)
        } else if net_pips > Decimal::ZERO {
            1.0
        } else {
            0.0
        };

        Ok(Opportunity {
            triangle_id: def.id.clone(),
            direction,
            synthetic,
            cross_bid: cross.bid,
            cross_ask: cross.ask,
            deviation_pips,
            spread_cost_pips,
            net_pips,
            confidence,
            ready,
            detected_at: now,
        })
    }

    /// Scan every triangle in the catalog onto `board`.
    pub fn scan(
        &self,
        catalog: &TriangleCatalog,
        book: &QuoteBook,
        board: &mut OpportunityBoard,
        now: DateTime<Utc>,
    ) -> ScanReport {
        let mut report = ScanReport::default();
        for def in catalog.iter() {
            match self.evaluate(def, book, now) {
                Ok(opp) => {
                    report.scanned += 1;
                    if opp.ready {
                        report.ready += 1;
                        info!(
                            triangle = %opp.triangle_id,
                            direction = %opp.direction,
                            net_pips = %opp.net_pips.round_dp(2),
                            spread = %opp.spread_cost_pips.round_dp(2),
                            "Opportunity ready"
                        );
                    }
                    board.post(opp);
                }
                Err(e) => {
                    debug!(triangle = %def.id, error = %e, "Triangle skipped this cycle");
                    report.skipped.push((def.id.clone(), e));
                }
            }
        }
        report
    }
}

// ---------------------------------------------------------------------------
// Board
// ---------------------------------------------------------------------------

/// Latest opportunity per triangle. No queueing: a newer scan replaces an
/// unconsumed older one.
#[derive(Debug, Default)]
pub struct OpportunityBoard {
    latest: HashMap<String, Opportunity>,
}

impl OpportunityBoard {
    pub fn post(&mut self, opp: Opportunity) {
        self.latest.insert(opp.triangle_id.clone(), opp);
    }

    pub fn get(&self, triangle_id: &str) -> Option<&Opportunity> {
        self.latest.get(triangle_id)
    }

    /// Ready opportunities, best net first.
    pub fn ready(&self) -> Vec<Opportunity> {
        let mut ready: Vec<Opportunity> = self.latest.values().filter(|o| o.ready).cloned().collect();
        ready.sort_by(|a, b| b.net_pips.cmp(&a.net_pips).then_with(|| a.triangle_id.cmp(&b.triangle_id)));
        ready
    }

    /// Every posted opportunity, best net first.
    pub fn all(&self) -> Vec<Opportunity> {
        let mut all: Vec<Opportunity> = self.latest.values().cloned().collect();
        all.sort_by(|a, b| b.net_pips.cmp(&a.net_pips));
        all
    }

    pub fn clear(&mut self) {
        self.latest.clear();
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
