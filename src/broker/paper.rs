//! In-memory paper broker.
//!
//! Implements both `PriceFeed` and `OrderGateway` with deterministic fills at
//! the current bid/ask. Faults (rejections, slow fills, rejected closes,
//! disconnects) can be injected per symbol so the engine's partial-failure
//! paths can be exercised without a real venue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rust_decimal::prelude::*;
use rust_decimal_macros::dec;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{AccountInfo, BrokerPosition, CloseOutcome, OrderGateway, OrderRequest, PriceFeed, SubmitOutcome};
use crate::types::{pip_size, to_pips, Direction, EngineError, Quote};

#[derive(Debug, Clone)]
pub struct PaperPosition {
    pub id: String,
    pub symbol: String,
    pub direction: Direction,
    pub volume: Decimal,
    pub open_price: Decimal,
}

#[derive(Debug, Default)]
struct Faults {
    reject_symbols: HashSet<String>,
    timeout_symbols: HashSet<String>,
    slow_symbols: HashMap<String, Duration>,
    reject_close_symbols: HashSet<String>,
}

pub struct PaperBroker {
    name: String,
    pip_value_per_lot: Decimal,
    margin_per_lot: Decimal,
    balance: Mutex<Decimal>,
    quotes: Mutex<HashMap<String, Quote>>,
    positions: Mutex<HashMap<String, PaperPosition>>,
    submissions: Mutex<Vec<OrderRequest>>,
    closes: Mutex<Vec<(String, Decimal)>>,
    faults: Mutex<Faults>,
    connected: AtomicBool,
}

impl PaperBroker {
    pub fn new(balance: Decimal, pip_value_per_lot: Decimal, margin_per_lot: Decimal) -> Self {
        Self {
            name: "paper".to_string(),
            pip_value_per_lot,
            margin_per_lot,
            balance: Mutex::new(balance),
            quotes: Mutex::new(HashMap::new()),
            positions: Mutex::new(HashMap::new()),
            submissions: Mutex::new(Vec::new()),
            closes: Mutex::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            connected: AtomicBool::new(true),
        }
    }

    // -- Quotes ---------------------------------------------------------------

    pub fn set_quote(&self, symbol: &str, bid: Decimal, ask: Decimal, at: DateTime<Utc>) {
        self.quotes
            .lock()
            .insert(symbol.to_string(), Quote::new(symbol, bid, ask, at));
    }

    /// Set a quote around `mid` with a total spread of `spread_pips`.
    pub fn set_mid(&self, symbol: &str, mid: Decimal, spread_pips: Decimal, at: DateTime<Utc>) {
        let half = spread_pips * pip_size(symbol) / dec!(2);
        self.set_quote(symbol, mid - half, mid + half, at);
    }

    /// Re-stamp every quote at `at` without moving prices.
    pub fn touch_all(&self, at: DateTime<Utc>) {
        for quote in self.quotes.lock().values_mut() {
            quote.timestamp = at;
        }
    }

    pub fn remove_quote(&self, symbol: &str) {
        self.quotes.lock().remove(symbol);
    }

    pub fn quote(&self, symbol: &str) -> Option<Quote> {
        self.quotes.lock().get(symbol).cloned()
    }

    /// Move every mid by an independent random step of roughly
    /// `volatility_pips` standard deviation.
    pub fn step_random_walk(&self, volatility_pips: f64, spread_pips: Decimal, at: DateTime<Utc>) {
        let mut rng = rand::thread_rng();
        let mut quotes = self.quotes.lock();
        for quote in quotes.values_mut() {
            // Sum of uniforms: cheap approximation of a normal step.
            let step: f64 = (0..4).map(|_| rng.gen_range(-1.0..1.0)).sum::<f64>() * volatility_pips * 0.866;
            let step = Decimal::from_f64(step).unwrap_or(Decimal::ZERO) * pip_size(&quote.symbol);
            let half = spread_pips * pip_size(&quote.symbol) / dec!(2);
            let mid = (quote.mid() + step).max(pip_size(&quote.symbol));
            quote.bid = mid - half;
            quote.ask = mid + half;
            quote.timestamp = at;
        }
    }

    // -- Fault injection --------------------------------------------------------

    pub fn reject_orders_for(&self, symbol: &str) {
        self.faults.lock().reject_symbols.insert(symbol.to_string());
    }

    pub fn timeout_orders_for(&self, symbol: &str) {
        self.faults.lock().timeout_symbols.insert(symbol.to_string());
    }

    /// Delay fills for `symbol` by `delay` (the caller's fill timeout decides).
    pub fn slow_fills_for(&self, symbol: &str, delay: Duration) {
        self.faults.lock().slow_symbols.insert(symbol.to_string(), delay);
    }

    pub fn reject_closes_for(&self, symbol: &str) {
        self.faults.lock().reject_close_symbols.insert(symbol.to_string());
    }

    pub fn clear_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    // -- Inspection -------------------------------------------------------------

    pub fn open_positions(&self) -> Vec<PaperPosition> {
        self.positions.lock().values().cloned().collect()
    }

    pub fn submissions(&self) -> Vec<OrderRequest> {
        self.submissions.lock().clone()
    }

    pub fn closes(&self) -> Vec<(String, Decimal)> {
        self.closes.lock().clone()
    }

    pub fn balance(&self) -> Decimal {
        *self.balance.lock()
    }

    fn position_pnl(&self, p: &PaperPosition, quotes: &HashMap<String, Quote>) -> Option<Decimal> {
        let quote = quotes.get(&p.symbol)?;
        let pips = to_pips(&p.symbol, (quote.exit_price(p.direction) - p.open_price) * p.direction.sign());
        Some(pips * p.volume * self.pip_value_per_lot)
    }

    fn floating_pnl(&self) -> Decimal {
        let quotes = self.quotes.lock().clone();
        self.positions
            .lock()
            .values()
            .filter_map(|p| self.position_pnl(p, &quotes))
            .sum()
    }
}

#[async_trait]
impl PriceFeed for PaperBroker {
    async fn latest_quote(&self, symbol: &str) -> Option<Quote> {
        self.quote(symbol)
    }
}

#[async_trait]
impl OrderGateway for PaperBroker {
    async fn submit(&self, order: &OrderRequest) -> SubmitOutcome {
        self.submissions.lock().push(order.clone());

        if !self.is_connected() {
            return SubmitOutcome::Rejected {
                reason: "disconnected".to_string(),
            };
        }

        let delay = {
            let faults = self.faults.lock();
            if faults.reject_symbols.contains(&order.symbol) {
                return SubmitOutcome::Rejected {
                    reason: format!("{} rejected by paper broker", order.symbol),
                };
            }
            if faults.timeout_symbols.contains(&order.symbol) {
                return SubmitOutcome::Timeout;
            }
            faults.slow_symbols.get(&order.symbol).copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let Some(quote) = self.quote(&order.symbol) else {
            return SubmitOutcome::Rejected {
                reason: format!("no price for {}", order.symbol),
            };
        };
        let price = quote.entry_price(order.direction);

        self.positions.lock().insert(
            order.client_id.clone(),
            PaperPosition {
                id: order.client_id.clone(),
                symbol: order.symbol.clone(),
                direction: order.direction,
                volume: order.volume,
                open_price: price,
            },
        );
        debug!(id = %order.client_id, symbol = %order.symbol, direction = %order.direction, volume = %order.volume, %price, "paper fill");
        SubmitOutcome::Filled { price }
    }

    async fn close(&self, position_id: &str, fraction: Decimal) -> CloseOutcome {
        self.closes.lock().push((position_id.to_string(), fraction));

        if !self.is_connected() {
            return CloseOutcome::Rejected {
                reason: "disconnected".to_string(),
            };
        }

        let mut positions = self.positions.lock();
        let Some(position) = positions.get_mut(position_id) else {
            return CloseOutcome::Rejected {
                reason: format!("unknown position {position_id}"),
            };
        };
        if self.faults.lock().reject_close_symbols.contains(&position.symbol) {
            return CloseOutcome::Rejected {
                reason: format!("close of {} rejected by paper broker", position.symbol),
            };
        }
        let Some(quote) = self.quote(&position.symbol) else {
            return CloseOutcome::Rejected {
                reason: format!("no price for {}", position.symbol),
            };
        };

        let fraction = fraction.clamp(Decimal::ZERO, Decimal::ONE);
        let closed_volume = if fraction == Decimal::ONE {
            position.volume
        } else {
            (position.volume * fraction).round_dp(8)
        };
        let pips = to_pips(
            &position.symbol,
            (quote.exit_price(position.direction) - position.open_price) * position.direction.sign(),
        );
        let realized_pnl = pips * closed_volume * self.pip_value_per_lot;
        position.volume -= closed_volume;
        if position.volume <= Decimal::ZERO {
            positions.remove(position_id);
        }
        drop(positions);

        *self.balance.lock() += realized_pnl;
        CloseOutcome::Closed { realized_pnl }
    }

    async fn account(&self) -> Result<AccountInfo, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::BrokerUnavailable);
        }
        let balance = self.balance();
        let equity = balance + self.floating_pnl();
        let used: Decimal = self
            .positions
            .lock()
            .values()
            .map(|p| p.volume * self.margin_per_lot)
            .sum();
        Ok(AccountInfo {
            balance,
            equity,
            free_margin: equity - used,
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
        if !self.is_connected() {
            return Err(EngineError::BrokerUnavailable);
        }
        let quotes = self.quotes.lock().clone();
        let positions = self
            .positions
            .lock()
            .values()
            .map(|p| BrokerPosition {
                id: p.id.clone(),
                symbol: p.symbol.clone(),
                direction: p.direction,
                volume: p.volume,
                open_price: p.open_price,
                floating_pnl: self.position_pnl(p, &quotes).unwrap_or(Decimal::ZERO),
            })
            .collect();
        Ok(positions)
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
