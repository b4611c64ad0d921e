//! Lot sizing.
//!
//! Two modes:
//! - `fixed`: every leg trades `base_lot_size`.
//! - `balanced`: every leg carries the same account-currency exposure
//!   (`target_exposure_per_leg`), computed from contract size and current
//!   rates. Legs whose exposure cannot be priced fall back to `base_lot_size`.
//!
//! All results are rounded to the broker lot step and clamped to
//! `[min_lot, max_lot]`.

use rust_decimal::prelude::*;
use tracing::debug;

use crate::config::{SizingConfig, SizingMode};
use crate::market::{QuoteBook, TriangleDefinition};
use crate::types::split_symbol;

pub struct LotSizer {
    config: SizingConfig,
}

impl LotSizer {
    pub fn new(config: SizingConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SizingConfig {
        &self.config
    }

    pub fn clamp(&self, lots: Decimal) -> Decimal {
        lots.clamp(self.config.min_lot, self.config.max_lot)
    }

    /// Nearest lot step, then clamp.
    pub fn round_to_step(&self, lots: Decimal) -> Decimal {
        self.clamp(self.nearest_step(lots))
    }

    /// Nearest multiple of the lot step, unclamped. Half a step rounds up.
    pub fn nearest_step(&self, lots: Decimal) -> Decimal {
        let step = self.config.lot_step;
        (lots / step).round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero) * step
    }

    /// Largest multiple of the lot step not above `lots`. Not clamped: the
    /// caller decides what a result below `min_lot` means.
    pub fn floor_to_step(&self, lots: Decimal) -> Decimal {
        let step = self.config.lot_step;
        ((lots / step).floor() * step).max(Decimal::ZERO)
    }

    /// Lots per leg in definition order (first, second, cross).
    pub fn triangle_lots(&self, def: &TriangleDefinition, book: &QuoteBook, account_currency: &str) -> [Decimal; 3] {
        let base = self.round_to_step(self.config.base_lot_size);
        if self.config.mode == SizingMode::Fixed {
            return [base; 3];
        }

        let lots = def.symbols().map(|symbol| match self.exposure_per_lot(symbol, book, account_currency) {
            Some(per_lot) if per_lot > Decimal::ZERO => {
                self.round_to_step(self.config.target_exposure_per_leg / per_lot)
            }
            _ => {
                debug!(symbol, "Exposure not priceable, using base lot");
                base
            }
        });
        debug!(triangle = %def.id, first = %lots[0], second = %lots[1], cross = %lots[2], "Balanced lots");
        lots
    }

    /// Account-currency value of one lot of `symbol`.
    pub fn exposure_per_lot(&self, symbol: &str, book: &QuoteBook, account_currency: &str) -> Option<Decimal> {
        let (base, quote) = split_symbol(symbol)?;
        let contract = self.config.contract_size;
        if base == account_currency {
            return Some(contract);
        }
        if quote == account_currency {
            return Some(contract * book.get(symbol)?.mid());
        }
        Some(contract * Self::conversion_rate(base, account_currency, book)?)
    }

    fn conversion_rate(from: &str, to: &str, book: &QuoteBook) -> Option<Decimal> {
        if let Some(q) = book.get(&format!("{from}{to}")) {
            return Some(q.mid());
        }
        let inverse = book.get(&format!("{to}{from}"))?.mid();
        (inverse > Decimal::ZERO).then(|| Decimal::ONE / inverse)
    }

    /// Volume for the next recovery layer.
    pub fn recovery_volume(&self, prior: Decimal, multiplier: Decimal) -> Decimal {
        self.round_to_step(prior * multiplier)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
