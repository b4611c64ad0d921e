//! Risk manager.
//!
//! Enforces the open-triangle limit, the global lot exposure limit and the
//! account margin requirement. Exposure is booked per triangle definition
//! so a definition can only ever have one live instance.
//!
//! Legs left open by a failed reversal stay booked as orphans until they are
//! closed. Their lots count toward the exposure limit and their definition
//! counts as open.
//!
//! The book sits behind a mutex: concurrent evaluations reserve and release
//! through `&self`, and a check plus its reservation happen under one lock.

use parking_lot::Mutex;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, warn};

use crate::config::RiskConfig;
use crate::engine::executor::OrphanedFill;
use crate::types::EngineError;

/// An orphaned position still held against its definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrphanExposure {
    pub position_id: String,
    pub definition_id: String,
    pub symbol: String,
    pub volume: Decimal,
}

#[derive(Debug, Default)]
struct ExposureBook {
    /// Open lots per triangle definition id.
    lots: HashMap<String, Decimal>,
    /// Orphans keyed by position id.
    orphans: BTreeMap<String, OrphanExposure>,
}

impl ExposureBook {
    fn total(&self) -> Decimal {
        self.lots.values().copied().sum::<Decimal>() + self.orphans.values().map(|o| o.volume).sum::<Decimal>()
    }

    fn holds(&self, definition_id: &str) -> bool {
        self.lots.contains_key(definition_id) || self.orphans.values().any(|o| o.definition_id == definition_id)
    }

    fn definitions(&self) -> usize {
        let mut ids: HashSet<&str> = self.lots.keys().map(String::as_str).collect();
        ids.extend(self.orphans.values().map(|o| o.definition_id.as_str()));
        ids.len()
    }

    fn hold_orphans(&mut self, definition_id: &str, orphans: &[OrphanedFill]) {
        for o in orphans {
            warn!(triangle = %definition_id, position = %o.position_id, symbol = %o.symbol, volume = %o.volume, "Orphaned position held against exposure");
            self.orphans.insert(
                o.position_id.clone(),
                OrphanExposure {
                    position_id: o.position_id.clone(),
                    definition_id: definition_id.to_string(),
                    symbol: o.symbol.clone(),
                    volume: o.volume,
                },
            );
        }
    }
}

pub struct RiskManager {
    config: RiskConfig,
    book: Mutex<ExposureBook>,
}

impl RiskManager {
    pub fn new(config: RiskConfig) -> Self {
        Self {
            config,
            book: Mutex::new(ExposureBook::default()),
        }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Reserve a new triangle entry of `lots` total lots.
    ///
    /// Checks in order: duplicate definition, open-triangle limit, global
    /// lot exposure.
    pub fn try_open_triangle(&self, definition_id: &str, lots: Decimal) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        if book.holds(definition_id) {
            return Err(EngineError::DuplicateTriangle(definition_id.to_string()));
        }
        if book.definitions() >= self.config.max_open_triangles {
            return Err(EngineError::TriangleLimit(self.config.max_open_triangles));
        }
        self.check_exposure(&book, lots)?;
        book.lots.insert(definition_id.to_string(), lots);
        debug!(triangle = %definition_id, %lots, total = %book.total(), "Triangle exposure reserved");
        Ok(())
    }

    /// Reserve additional lots for an open triangle (recovery layer).
    pub fn try_add_lots(&self, definition_id: &str, lots: Decimal) -> Result<(), EngineError> {
        let mut book = self.book.lock();
        self.check_exposure(&book, lots)?;
        *book.lots.entry(definition_id.to_string()).or_default() += lots;
        Ok(())
    }

    /// Release lots after a partial close or a failed layer.
    pub fn release_lots(&self, definition_id: &str, lots: Decimal) {
        let mut book = self.book.lock();
        if let Some(open) = book.lots.get_mut(definition_id) {
            *open = (*open - lots).max(Decimal::ZERO);
        }
    }

    /// Drop the definition from the book entirely (instance closed or never opened).
    pub fn release_triangle(&self, definition_id: &str) {
        if self.book.lock().lots.remove(definition_id).is_some() {
            debug!(triangle = %definition_id, "Triangle exposure released");
        }
    }

    /// Settle a layer-0 entry that did not fill: the reservation is dropped
    /// and any orphaned leg is booked in its place.
    pub fn settle_failed_entry(&self, definition_id: &str, orphans: &[OrphanedFill]) {
        let mut book = self.book.lock();
        book.lots.remove(definition_id);
        book.hold_orphans(definition_id, orphans);
    }

    /// Settle a recovery layer that did not fill: `reserved` lots are given
    /// back and any orphaned leg is booked in their place.
    pub fn settle_failed_layer(&self, definition_id: &str, reserved: Decimal, orphans: &[OrphanedFill]) {
        let mut book = self.book.lock();
        if let Some(open) = book.lots.get_mut(definition_id) {
            *open = (*open - reserved).max(Decimal::ZERO);
        }
        book.hold_orphans(definition_id, orphans);
    }

    pub fn orphans(&self) -> Vec<OrphanExposure> {
        self.book.lock().orphans.values().cloned().collect()
    }

    /// Drop an orphan once its position is flat.
    pub fn release_orphan(&self, position_id: &str) -> Option<OrphanExposure> {
        let released = self.book.lock().orphans.remove(position_id);
        if let Some(o) = &released {
            debug!(triangle = %o.definition_id, position = %o.position_id, "Orphan exposure released");
        }
        released
    }

    /// Largest lot amount that could still be added under the exposure limit.
    pub fn exposure_headroom(&self) -> Decimal {
        (self.config.max_total_lots - self.book.lock().total()).max(Decimal::ZERO)
    }

    fn check_exposure(&self, book: &ExposureBook, lots: Decimal) -> Result<(), EngineError> {
        let open = book.total();
        if open + lots > self.config.max_total_lots {
            warn!(%lots, %open, limit = %self.config.max_total_lots, "Exposure limit reached");
            return Err(EngineError::ExposureLimit {
                requested: lots,
                open,
                limit: self.config.max_total_lots,
            });
        }
        Ok(())
    }

    // -- Margin ---------------------------------------------------------------

    pub fn margin_required(&self, lots: Decimal) -> Decimal {
        lots * self.config.margin_per_lot
    }

    pub fn check_margin(&self, lots: Decimal, free_margin: Decimal) -> Result<(), EngineError> {
        let required = self.margin_required(lots);
        if required > free_margin {
            return Err(EngineError::MarginInsufficient {
                required,
                available: free_margin,
            });
        }
        Ok(())
    }

    /// Lots that `free_margin` can carry.
    pub fn affordable_lots(&self, free_margin: Decimal) -> Decimal {
        if self.config.margin_per_lot <= Decimal::ZERO {
            return Decimal::MAX;
        }
        (free_margin / self.config.margin_per_lot).max(Decimal::ZERO)
    }

    // -- Inspection -----------------------------------------------------------

    pub fn open_lots(&self) -> Decimal {
        self.book.lock().total()
    }

    pub fn open_triangles(&self) -> usize {
        self.book.lock().definitions()
    }

    pub fn is_open(&self, definition_id: &str) -> bool {
        self.book.lock().holds(definition_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn manager() -> RiskManager {
        RiskManager::new(RiskConfig {
            max_total_lots: dec!(1),
            max_open_triangles: 2,
            margin_per_lot: dec!(1000),
            ..RiskConfig::default()
        })
    }

    #[test]
    fn test_duplicate_rejected() {
        let rm = manager();
        rm.try_open_triangle("A", dec!(0.3)).unwrap();
        assert_eq!(
            rm.try_open_triangle("A", dec!(0.3)),
            Err(EngineError::DuplicateTriangle("A".into()))
        );
    }

    #[test]
    fn test_triangle_limit() {
        let rm = manager();
        rm.try_open_triangle("A", dec!(0.1)).unwrap();
        rm.try_open_triangle("B", dec!(0.1)).unwrap();
        assert_eq!(rm.try_open_triangle("C", dec!(0.1)), Err(EngineError::TriangleLimit(2)));
        rm.release_triangle("A");
        assert!(rm.try_open_triangle("C", dec!(0.1)).is_ok());
    }

    #[test]
    fn test_exposure_limit_and_release() {
        let rm = manager();
        rm.try_open_triangle("A", dec!(0.6)).unwrap();
        assert!(matches!(
            rm.try_open_triangle("B", dec!(0.6)),
            Err(EngineError::ExposureLimit { .. })
        ));
        assert!(!rm.is_open("B"));

        rm.try_add_lots("A", dec!(0.3)).unwrap();
        assert_eq!(rm.open_lots(), dec!(0.9));
        assert_eq!(rm.exposure_headroom(), dec!(0.1));
        rm.release_lots("A", dec!(0.5));
        assert_eq!(rm.open_lots(), dec!(0.4));
    }

    fn orphan(id: &str, volume: Decimal) -> OrphanedFill {
        OrphanedFill {
            position_id: id.into(),
            symbol: "EURUSD".into(),
            volume,
            reason: "close rejected".into(),
        }
    }

    #[test]
    fn test_orphans_stay_booked_until_released() {
        let rm = manager();
        rm.try_open_triangle("A", dec!(0.3)).unwrap();
        rm.settle_failed_entry("A", &[orphan("p1", dec!(0.1))]);

        assert_eq!(rm.open_lots(), dec!(0.1));
        assert!(rm.is_open("A"));
        assert_eq!(rm.open_triangles(), 1);
        assert_eq!(rm.try_open_triangle("A", dec!(0.3)), Err(EngineError::DuplicateTriangle("A".into())));
        assert_eq!(rm.exposure_headroom(), dec!(0.9));

        let released = rm.release_orphan("p1").unwrap();
        assert_eq!(released.definition_id, "A");
        assert_eq!(rm.open_lots(), Decimal::ZERO);
        assert!(!rm.is_open("A"));
        assert!(rm.release_orphan("p1").is_none());
    }

    #[test]
    fn test_failed_layer_keeps_orphan_volume() {
        let rm = manager();
        rm.try_open_triangle("A", dec!(0.3)).unwrap();
        rm.try_add_lots("A", dec!(0.3)).unwrap();
        rm.settle_failed_layer("A", dec!(0.3), &[orphan("h1", dec!(0.15))]);
        assert_eq!(rm.open_lots(), dec!(0.45));

        // the triangle closes but its orphan is still out there
        rm.release_triangle("A");
        assert_eq!(rm.open_lots(), dec!(0.15));
        assert!(rm.is_open("A"));
        assert_eq!(rm.orphans().len(), 1);
    }

    #[test]
    fn test_margin() {
        let rm = manager();
        assert!(rm.check_margin(dec!(0.3), dec!(300)).is_ok());
        assert_eq!(
            rm.check_margin(dec!(0.3), dec!(299)),
            Err(EngineError::MarginInsufficient {
                required: dec!(300),
                available: dec!(299)
            })
        );
        assert_eq!(rm.affordable_lots(dec!(250)), dec!(0.25));
        assert_eq!(rm.affordable_lots(dec!(-5)), dec!(0));
    }
}
