//! Correlation pair table.
//!
//! `CorrelationTable` is shared by every evaluation and replaced wholesale:
//! readers take an `Arc` snapshot, the updater swaps in a new matrix. A
//! reader never observes a half-applied refresh.
//!
//! `ReturnsWindow` keeps a bounded history of mid prices per symbol and
//! computes Pearson correlation of log returns from it.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::prelude::*;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::config::CorrelationSeed;

// ---------------------------------------------------------------------------
// Matrix
// ---------------------------------------------------------------------------

/// Symmetric symbol-pair correlation coefficients in [-1, 1].
#[derive(Debug, Clone, Default)]
pub struct CorrelationMatrix {
    pairs: BTreeMap<(String, String), f64>,
    pub computed_at: Option<DateTime<Utc>>,
}

fn key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl CorrelationMatrix {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_seeds(seeds: &[CorrelationSeed]) -> Self {
        let mut m = Self::new();
        for s in seeds {
            m.set(&s.a, &s.b, s.coefficient);
        }
        m
    }

    /// Set the coefficient for `a`/`b`, clamped into [-1, 1]. NaN is ignored.
    pub fn set(&mut self, a: &str, b: &str, coefficient: f64) {
        if a == b || coefficient.is_nan() {
            return;
        }
        self.pairs.insert(key(a, b), coefficient.clamp(-1.0, 1.0));
    }

    pub fn get(&self, a: &str, b: &str) -> Option<f64> {
        if a == b {
            return Some(1.0);
        }
        self.pairs.get(&key(a, b)).copied()
    }

    /// Symbols correlated with `symbol` at |ρ| ≥ `min_abs`, strongest first.
    pub fn strongest_for(&self, symbol: &str, min_abs: f64) -> Vec<(String, f64)> {
        let mut out: Vec<(String, f64)> = self
            .pairs
            .iter()
            .filter_map(|((a, b), rho)| {
                let other = if a == symbol {
                    b
                } else if b == symbol {
                    a
                } else {
                    return None;
                };
                (rho.abs() >= min_abs).then(|| (other.clone(), *rho))
            })
            .collect();
        out.sort_by(|x, y| {
            y.1.abs()
                .partial_cmp(&x.1.abs())
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| x.0.cmp(&y.0))
        });
        out
    }

    /// Overlay every pair of `other` onto this matrix.
    pub fn merge(&mut self, other: &CorrelationMatrix) {
        for (k, v) in &other.pairs {
            self.pairs.insert(k.clone(), *v);
        }
        if other.computed_at.is_some() {
            self.computed_at = other.computed_at;
        }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        self.pairs.iter().map(|((a, b), r)| (a.as_str(), b.as_str(), *r))
    }
}

// ---------------------------------------------------------------------------
// Shared table
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct CorrelationTable {
    current: RwLock<Arc<CorrelationMatrix>>,
}

impl CorrelationTable {
    pub fn new(initial: CorrelationMatrix) -> Self {
        Self {
            current: RwLock::new(Arc::new(initial)),
        }
    }

    /// Consistent view for the duration of one evaluation.
    pub fn snapshot(&self) -> Arc<CorrelationMatrix> {
        self.current.read().clone()
    }

    /// Replace the whole table atomically.
    pub fn update(&self, matrix: CorrelationMatrix) {
        *self.current.write() = Arc::new(matrix);
    }
}

// ---------------------------------------------------------------------------
// Rolling returns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ReturnsWindow {
    window: usize,
    prices: HashMap<String, VecDeque<f64>>,
    last_seen: HashMap<String, DateTime<Utc>>,
}

impl ReturnsWindow {
    /// Keep at most `window` returns (`window + 1` prices) per symbol.
    pub fn new(window: usize) -> Self {
        Self {
            window,
            prices: HashMap::new(),
            last_seen: HashMap::new(),
        }
    }

    /// Record a mid price. A quote already sampled (same timestamp) is ignored.
    pub fn record(&mut self, symbol: &str, mid: Decimal, at: DateTime<Utc>) {
        if self.last_seen.get(symbol) == Some(&at) {
            return;
        }
        let Some(price) = mid.to_f64().filter(|p| *p > 0.0) else {
            return;
        };
        self.last_seen.insert(symbol.to_string(), at);
        let series = self.prices.entry(symbol.to_string()).or_default();
        series.push_back(price);
        while series.len() > self.window + 1 {
            series.pop_front();
        }
    }

    pub fn log_returns(&self, symbol: &str) -> Vec<f64> {
        self.prices
            .get(symbol)
            .map(|s| {
                s.iter()
                    .zip(s.iter().skip(1))
                    .map(|(p0, p1)| (p1 / p0).ln())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Pearson coefficients for every symbol pair with at least
    /// `min_samples` overlapping returns. Series are aligned on their most
    /// recent samples.
    pub fn compute(&self, min_samples: usize, at: DateTime<Utc>) -> CorrelationMatrix {
        let mut symbols: Vec<&String> = self.prices.keys().collect();
        symbols.sort();
        let returns: HashMap<&String, Vec<f64>> = symbols.iter().map(|s| (*s, self.log_returns(s))).collect();

        let mut matrix = CorrelationMatrix::new();
        for (i, a) in symbols.iter().enumerate() {
            for b in symbols.iter().skip(i + 1) {
                let (ra, rb) = (&returns[a], &returns[b]);
                let n = ra.len().min(rb.len());
                if n < min_samples {
                    continue;
                }
                if let Some(rho) = pearson(&ra[ra.len() - n..], &rb[rb.len() - n..]) {
                    matrix.set(a, b, rho);
                }
            }
        }
        matrix.computed_at = Some(at);
        matrix
    }
}

/// Pearson correlation of two equal-length samples; `None` when either has
/// zero variance.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b) {
        let (dx, dy) = (x - mean_a, y - mean_b);
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }
    if var_a <= f64::EPSILON || var_b <= f64::EPSILON {
        return None;
    }
    Some((cov / (var_a.sqrt() * var_b.sqrt())).clamp(-1.0, 1.0))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
