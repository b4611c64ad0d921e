//! Pair/triangle catalog.
//!
//! Derives every closed three-currency loop from the tradable symbol set.
//! Each triangle is expressed as `first` (X/Y) × `second` (Y/Z) against the
//! quoted `cross` (X/Z); a leg whose tradable symbol is quoted the other way
//! round carries `inverted = true`.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use tracing::{debug, info};

use crate::types::{split_symbol, Direction};

/// Which side of the loop is cheap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArbDirection {
    /// Synthetic above the cross ask: buy the cross, sell the synthetic.
    Forward,
    /// Synthetic below the cross bid: sell the cross, buy the synthetic.
    Reverse,
}

impl fmt::Display for ArbDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArbDirection::Forward => write!(f, "forward"),
            ArbDirection::Reverse => write!(f, "reverse"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegSpec {
    pub symbol: String,
    /// The symbol is quoted Y/X where the loop needs X/Y.
    pub inverted: bool,
}

impl LegSpec {
    fn new(symbol: &str, inverted: bool) -> Self {
        Self {
            symbol: symbol.to_string(),
            inverted,
        }
    }
}

/// Immutable description of one triangle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriangleDefinition {
    pub id: String,
    pub first: LegSpec,
    pub second: LegSpec,
    pub cross: LegSpec,
}

impl TriangleDefinition {
    /// The three symbols in leg order (first, second, cross).
    pub fn symbols(&self) -> [&str; 3] {
        [&self.first.symbol, &self.second.symbol, &self.cross.symbol]
    }

    /// Trade direction for each leg (first, second, cross) that realizes
    /// the arbitrage in `direction`.
    pub fn leg_directions(&self, direction: ArbDirection) -> [(String, Direction); 3] {
        let synthetic = match direction {
            ArbDirection::Forward => Direction::Sell,
            ArbDirection::Reverse => Direction::Buy,
        };
        let leg = |spec: &LegSpec, dir: Direction| {
            let dir = if spec.inverted { dir.opposite() } else { dir };
            (spec.symbol.clone(), dir)
        };
        [
            leg(&self.first, synthetic),
            leg(&self.second, synthetic),
            leg(&self.cross, synthetic.opposite()),
        ]
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols().contains(&symbol)
    }
}

impl fmt::Display for TriangleDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.id)
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct TriangleCatalog {
    triangles: Vec<TriangleDefinition>,
    index: HashMap<String, usize>,
}

impl TriangleCatalog {
    /// Derive every triangle from `symbols`. The cross leg is the symbol that
    /// does not contain `anchor`; when several qualify the earliest in
    /// `symbols` wins.
    pub fn derive(symbols: &[String], anchor: &str) -> Self {
        let pairs: Vec<(&str, &str, &str)> = symbols
            .iter()
            .filter_map(|s| split_symbol(s).map(|(b, q)| (s.as_str(), b, q)))
            .collect();

        let mut catalog = Self::default();
        let mut seen: BTreeSet<BTreeSet<(&str, &str)>> = BTreeSet::new();

        for i in 0..pairs.len() {
            for j in (i + 1)..pairs.len() {
                for k in (j + 1)..pairs.len() {
                    let trio = [pairs[i], pairs[j], pairs[k]];
                    let Some(def) = Self::build(&trio, anchor) else {
                        continue;
                    };
                    // Same currency loop via differently-suffixed symbols counts once.
                    let key: BTreeSet<(&str, &str)> = trio
                        .iter()
                        .map(|(_, b, q)| if b < q { (*b, *q) } else { (*q, *b) })
                        .collect();
                    if !seen.insert(key) {
                        continue;
                    }
                    debug!(triangle = %def.id, "Triangle derived");
                    catalog.index.insert(def.id.clone(), catalog.triangles.len());
                    catalog.triangles.push(def);
                }
            }
        }

        info!(symbols = symbols.len(), triangles = catalog.triangles.len(), "Triangle catalog built");
        catalog
    }

    fn build(trio: &[(&str, &str, &str); 3], anchor: &str) -> Option<TriangleDefinition> {
        // A closed loop over three currencies: each appears in exactly two pairs.
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for (_, b, q) in trio {
            if b == q {
                return None;
            }
            *counts.entry(*b).or_default() += 1;
            *counts.entry(*q).or_default() += 1;
        }
        if counts.len() != 3 || counts.values().any(|&c| c != 2) {
            return None;
        }

        let cross_idx = trio
            .iter()
            .position(|(_, b, q)| *b != anchor && *q != anchor)
            .unwrap_or(0);
        let (cross_symbol, x, z) = trio[cross_idx];

        let mut first = None;
        let mut second = None;
        for (idx, (symbol, b, q)) in trio.iter().enumerate() {
            if idx == cross_idx {
                continue;
            }
            if *b == x {
                first = Some(LegSpec::new(symbol, false));
            } else if *q == x {
                first = Some(LegSpec::new(symbol, true));
            } else if *q == z {
                second = Some(LegSpec::new(symbol, false));
            } else if *b == z {
                second = Some(LegSpec::new(symbol, true));
            }
        }
        let (first, second) = (first?, second?);

        Some(TriangleDefinition {
            id: format!("{}-{}-{}", first.symbol, second.symbol, cross_symbol),
            first,
            second,
            cross: LegSpec::new(cross_symbol, false),
        })
    }

    pub fn get(&self, id: &str) -> Option<&TriangleDefinition> {
        self.index.get(id).map(|&i| &self.triangles[i])
    }

    pub fn iter(&self) -> impl Iterator<Item = &TriangleDefinition> {
        self.triangles.iter()
    }

    pub fn len(&self) -> usize {
        self.triangles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.triangles.is_empty()
    }

    /// Every symbol used by at least one triangle, sorted.
    pub fn symbols(&self) -> Vec<String> {
        let set: BTreeSet<&str> = self.triangles.iter().flat_map(|t| t.symbols()).collect();
        set.into_iter().map(String::from).collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn syms(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_derives_eur_usd_jpy() {
        let cat = TriangleCatalog::derive(&syms(&["EURUSD", "USDJPY", "EURJPY"]), "USD");
        assert_eq!(cat.len(), 1);
        let t = cat.get("EURUSD-USDJPY-EURJPY").unwrap();
        assert!(!t.first.inverted);
        assert!(!t.second.inverted);
        assert_eq!(t.cross.symbol, "EURJPY");
    }

    #[test]
    fn test_inverted_leg() {
        let cat = TriangleCatalog::derive(&syms(&["EURUSD", "GBPUSD", "EURGBP"]), "USD");
        let t = cat.iter().next().unwrap();
        assert_eq!(t.id, "EURUSD-GBPUSD-EURGBP");
        assert!(!t.first.inverted);
        assert!(t.second.inverted);
    }

    #[test]
    fn test_default_symbol_set() {
        let cat = TriangleCatalog::derive(
            &syms(&["EURUSD", "GBPUSD", "USDJPY", "EURJPY", "GBPJPY", "EURGBP"]),
            "USD",
        );
        // EUR-USD-JPY, GBP-USD-JPY, EUR-GBP-USD, EUR-GBP-JPY
        assert_eq!(cat.len(), 4);
        assert_eq!(cat.symbols().len(), 6);
        for t in cat.iter() {
            let legs: BTreeSet<&str> = t.symbols().into_iter().collect();
            assert_eq!(legs.len(), 3);
        }
    }

    #[test]
    fn test_open_chain_is_not_a_triangle() {
        let cat = TriangleCatalog::derive(&syms(&["EURUSD", "USDJPY", "GBPCHF"]), "USD");
        assert!(cat.is_empty());
    }

    #[test]
    fn test_leg_directions() {
        let cat = TriangleCatalog::derive(&syms(&["EURUSD", "USDJPY", "EURJPY"]), "USD");
        let t = cat.iter().next().unwrap();
        let fwd = t.leg_directions(ArbDirection::Forward);
        assert_eq!(fwd[0], ("EURUSD".to_string(), Direction::Sell));
        assert_eq!(fwd[1], ("USDJPY".to_string(), Direction::Sell));
        assert_eq!(fwd[2], ("EURJPY".to_string(), Direction::Buy));

        let cat = TriangleCatalog::derive(&syms(&["EURUSD", "GBPUSD", "EURGBP"]), "USD");
        let t = cat.iter().next().unwrap();
        let rev = t.leg_directions(ArbDirection::Reverse);
        assert_eq!(rev[0].1, Direction::Buy);
        assert_eq!(rev[1].1, Direction::Sell); // inverted GBPUSD
        assert_eq!(rev[2].1, Direction::Sell);
    }
}
