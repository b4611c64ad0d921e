//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Every section has defaults, so a config file only needs to name what
//! it changes. The parameter set is validated once at start and is
//! immutable for the rest of the run.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;

use crate::types::EngineError;

/// Upper bound for every configured duration: ten years.
pub const MAX_DURATION_SECS: u64 = 315_360_000;

/// `secs` as a chrono duration, saturating instead of overflowing.
pub fn seconds(secs: u64) -> chrono::Duration {
    i64::try_from(secs)
        .ok()
        .and_then(chrono::Duration::try_seconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// `ms` as a chrono duration, saturating instead of overflowing.
pub fn milliseconds(ms: u64) -> chrono::Duration {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or(chrono::Duration::MAX)
}

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub trading: TradingConfig,
    pub sizing: SizingConfig,
    pub risk: RiskConfig,
    pub recovery: RecoveryConfig,
    pub harvest: HarvestConfig,
    pub correlation: CorrelationConfig,
    pub execution: ExecutionConfig,
    pub paper: PaperConfig,
    pub dashboard: DashboardConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    pub tick_interval_ms: u64,
    /// Quotes older than this are treated as unavailable.
    pub quote_staleness_ms: u64,
    /// Account-currency value of one pip on one lot.
    pub pip_value_per_lot: Decimal,
    /// Closed triangles kept in memory for the snapshot.
    pub history_limit: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "HELIX-001".to_string(),
            tick_interval_ms: 250,
            quote_staleness_ms: 2_000,
            pip_value_per_lot: dec!(10),
            history_limit: 100,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub symbols: Vec<String>,
    /// Minimum net profit (pips, after spreads) for an opportunity to be ready.
    pub min_arbitrage_profit: Decimal,
    /// Maximum total spread cost (pips) across the three legs.
    pub max_spread_cost: Decimal,
    /// Currency avoided as the cross leg when deriving triangles.
    pub anchor_currency: String,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbols: ["EURUSD", "GBPUSD", "USDJPY", "EURJPY", "GBPJPY", "EURGBP"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            min_arbitrage_profit: dec!(5),
            max_spread_cost: dec!(8),
            anchor_currency: "USD".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingMode {
    Fixed,
    Balanced,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SizingConfig {
    pub mode: SizingMode,
    /// Currency the account (and `target_exposure_per_leg`) is denominated in.
    pub account_currency: String,
    pub base_lot_size: Decimal,
    /// Account-currency exposure per leg in `balanced` mode.
    pub target_exposure_per_leg: Decimal,
    pub contract_size: Decimal,
    pub lot_step: Decimal,
    pub min_lot: Decimal,
    pub max_lot: Decimal,
}

impl Default for SizingConfig {
    fn default() -> Self {
        Self {
            mode: SizingMode::Fixed,
            account_currency: "USD".to_string(),
            base_lot_size: dec!(0.01),
            target_exposure_per_leg: dec!(10000),
            contract_size: dec!(100000),
            lot_step: dec!(0.01),
            min_lot: dec!(0.01),
            max_lot: dec!(100),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    /// Global limit on open lots across every leg of every triangle.
    pub max_total_lots: Decimal,
    pub max_open_triangles: usize,
    /// Margin the broker requires per open lot.
    pub margin_per_lot: Decimal,
    /// Aggregate loss (pips) at which a triangle is closed outright.
    pub emergency_stop_pips: Option<Decimal>,
    /// Triangles older than this are closed.
    pub max_triangle_age_secs: Option<u64>,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_total_lots: dec!(20),
            max_open_triangles: 10,
            margin_per_lot: dec!(1000),
            emergency_stop_pips: None,
            max_triangle_age_secs: None,
        }
    }
}

impl RiskConfig {
    pub fn max_triangle_age(&self) -> Option<chrono::Duration> {
        self.max_triangle_age_secs.map(seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub max_recovery_layers: u32,
    pub recovery_multiplier: Decimal,
    pub strong_correlation: f64,
    pub recovery_delay_secs: u64,
    /// Loss (pips) that opens layer 1.
    pub trigger_pips: Decimal,
    /// Additional loss required for each further layer.
    pub layer_step_pips: Decimal,
    pub hedges_per_layer: usize,
    /// Recovering triangles older than this (since the first layer) are closed.
    pub max_recovery_secs: Option<u64>,
    /// Recovery completes, and its layers are closed, once the hedges plus
    /// the legs they hedge float more than this (account currency).
    pub completion_profit: Decimal,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_recovery_layers: 6,
            recovery_multiplier: dec!(1.5),
            strong_correlation: 0.8,
            recovery_delay_secs: 30,
            trigger_pips: dec!(20),
            layer_step_pips: dec!(20),
            hedges_per_layer: 1,
            max_recovery_secs: Some(14_400),
            completion_profit: Decimal::ZERO,
        }
    }
}

impl RecoveryConfig {
    /// Loss threshold (negative pips) for opening `layer`.
    pub fn threshold_for(&self, layer: u32) -> Decimal {
        let steps = Decimal::from(layer.saturating_sub(1));
        -(self.trigger_pips + steps * self.layer_step_pips)
    }

    pub fn recovery_delay(&self) -> chrono::Duration {
        seconds(self.recovery_delay_secs)
    }

    pub fn max_recovery_duration(&self) -> Option<chrono::Duration> {
        self.max_recovery_secs.map(seconds)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestMode {
    Levels,
    Trailing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HarvestScope {
    /// Partial closes only touch legs currently in profit.
    Contributing,
    AllLegs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestLevelConfig {
    pub name: String,
    pub pips: Decimal,
    /// Percent of the layer's starting volume closed at this level.
    pub percent: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrailingConfig {
    pub activation_pips: Decimal,
    pub distance_pips: Decimal,
    /// Pips of distance removed per pip of peak beyond activation.
    pub tighten_ratio: Decimal,
    pub min_distance_pips: Decimal,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            activation_pips: dec!(15),
            distance_pips: dec!(10),
            tighten_ratio: dec!(0.25),
            min_distance_pips: dec!(4),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    pub mode: HarvestMode,
    pub scope: HarvestScope,
    pub levels: Vec<HarvestLevelConfig>,
    pub trailing: TrailingConfig,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        let level = |name: &str, pips: Decimal, percent: Decimal| HarvestLevelConfig {
            name: name.to_string(),
            pips,
            percent,
        };
        Self {
            mode: HarvestMode::Levels,
            scope: HarvestScope::Contributing,
            levels: vec![
                level("quick_scalp", dec!(8), dec!(25)),
                level("partial_1", dec!(15), dec!(25)),
                level("partial_2", dec!(25), dec!(30)),
                level("final_target", dec!(40), dec!(20)),
            ],
            trailing: TrailingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationSeed {
    pub a: String,
    pub b: String,
    pub coefficient: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    /// Mid-price samples kept per symbol.
    pub window: usize,
    /// Returns required before a pair's coefficient is computed.
    pub min_samples: usize,
    pub refresh_secs: u64,
    pub seed: Vec<CorrelationSeed>,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            window: 240,
            min_samples: 30,
            refresh_secs: 60,
            seed: Vec::new(),
        }
    }
}

impl CorrelationConfig {
    pub fn refresh_interval(&self) -> chrono::Duration {
        seconds(self.refresh_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub fill_timeout_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            fill_timeout_ms: 3_000,
        }
    }
}

impl ExecutionConfig {
    pub fn fill_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.fill_timeout_ms)
    }
}

/// Settings for the in-memory paper broker used by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub balance: Decimal,
    pub spread_pips: Decimal,
    /// Standard deviation of the per-tick random walk, in pips.
    pub volatility_pips: f64,
    pub initial_prices: HashMap<String, Decimal>,
}

impl Default for PaperConfig {
    fn default() -> Self {
        let prices = [
            ("EURUSD", dec!(1.0850)),
            ("GBPUSD", dec!(1.2650)),
            ("USDJPY", dec!(149.80)),
            ("EURJPY", dec!(162.53)),
            ("GBPJPY", dec!(189.50)),
            ("EURGBP", dec!(0.8577)),
        ];
        Self {
            balance: dec!(10000),
            spread_pips: dec!(0.5),
            volatility_pips: 1.5,
            initial_prices: prices.iter().map(|(s, p)| (s.to_string(), *p)).collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub events_path: String,
    pub snapshot_path: String,
    pub snapshot_every_ticks: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            events_path: "data/events.jsonl".to_string(),
            snapshot_path: "data/snapshot.json".to_string(),
            snapshot_every_ticks: 20,
        }
    }
}

impl AppConfig {
    /// Load and validate configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config = Self::from_toml(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config
            .validate()
            .with_context(|| format!("Invalid configuration in {path}"))?;
        Ok(config)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(contents)?;
        Ok(config)
    }

    pub fn quote_staleness(&self) -> chrono::Duration {
        milliseconds(self.engine.quote_staleness_ms)
    }

    /// Reject parameter sets the engine cannot run safely with.
    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |msg: String| Err(EngineError::Config(msg));

        if self.engine.tick_interval_ms == 0 {
            return fail("engine.tick_interval_ms must be positive".into());
        }
        if self.engine.quote_staleness_ms == 0 {
            return fail("engine.quote_staleness_ms must be positive".into());
        }
        let max_ms = MAX_DURATION_SECS * 1_000;
        let durations = [
            ("engine.tick_interval_ms", Some(self.engine.tick_interval_ms), max_ms),
            ("engine.quote_staleness_ms", Some(self.engine.quote_staleness_ms), max_ms),
            ("execution.fill_timeout_ms", Some(self.execution.fill_timeout_ms), max_ms),
            ("recovery.recovery_delay_secs", Some(self.recovery.recovery_delay_secs), MAX_DURATION_SECS),
            ("recovery.max_recovery_secs", self.recovery.max_recovery_secs, MAX_DURATION_SECS),
            ("risk.max_triangle_age_secs", self.risk.max_triangle_age_secs, MAX_DURATION_SECS),
            ("correlation.refresh_secs", Some(self.correlation.refresh_secs), MAX_DURATION_SECS),
        ];
        for (key, value, limit) in durations {
            if matches!(value, Some(v) if v > limit) {
                return fail(format!("{key} is above the ten-year limit of {limit}"));
            }
        }
        if self.engine.pip_value_per_lot <= Decimal::ZERO {
            return fail("engine.pip_value_per_lot must be positive".into());
        }
        if self.trading.symbols.len() < 3 {
            return fail("trading.symbols needs at least three symbols".into());
        }
        if self.trading.min_arbitrage_profit < Decimal::ZERO {
            return fail("trading.min_arbitrage_profit must not be negative".into());
        }
        if self.trading.max_spread_cost <= Decimal::ZERO {
            return fail("trading.max_spread_cost must be positive".into());
        }

        let s = &self.sizing;
        if s.lot_step <= Decimal::ZERO || s.min_lot <= Decimal::ZERO {
            return fail("sizing.lot_step and sizing.min_lot must be positive".into());
        }
        if s.min_lot > s.max_lot || s.base_lot_size < s.min_lot || s.base_lot_size > s.max_lot {
            return fail(format!(
                "sizing lots inconsistent: min {} base {} max {}",
                s.min_lot, s.base_lot_size, s.max_lot
            ));
        }

        if self.risk.max_total_lots <= Decimal::ZERO || self.risk.max_open_triangles == 0 {
            return fail("risk limits must be positive".into());
        }
        if matches!(self.risk.emergency_stop_pips, Some(p) if p <= Decimal::ZERO) {
            return fail("risk.emergency_stop_pips is a loss distance and must be positive".into());
        }

        let r = &self.recovery;
        if r.recovery_multiplier < Decimal::ONE {
            return fail("recovery.recovery_multiplier must be >= 1".into());
        }
        if !(r.strong_correlation > 0.0 && r.strong_correlation <= 1.0) {
            return fail("recovery.strong_correlation must be in (0, 1]".into());
        }
        if r.trigger_pips <= Decimal::ZERO || r.layer_step_pips < Decimal::ZERO {
            return fail("recovery.trigger_pips must be positive".into());
        }
        if r.hedges_per_layer == 0 {
            return fail("recovery.hedges_per_layer must be at least 1".into());
        }
        if r.completion_profit < Decimal::ZERO {
            return fail("recovery.completion_profit must not be negative".into());
        }

        let h = &self.harvest;
        if h.mode == HarvestMode::Levels && h.levels.is_empty() {
            return fail("harvest.levels must not be empty in levels mode".into());
        }
        let mut total = Decimal::ZERO;
        let mut previous: Option<Decimal> = None;
        for level in &h.levels {
            if level.pips <= Decimal::ZERO {
                return fail(format!("harvest level {} must have positive pips", level.name));
            }
            if level.percent <= Decimal::ZERO || level.percent > dec!(100) {
                return fail(format!("harvest level {} percent must be in (0, 100]", level.name));
            }
            if matches!(previous, Some(p) if level.pips <= p) {
                return fail("harvest levels must be strictly ascending in pips".into());
            }
            previous = Some(level.pips);
            total += level.percent;
        }
        if total > dec!(100) {
            return fail(format!("harvest level percentages sum to {total}, above 100"));
        }
        let t = &h.trailing;
        if t.min_distance_pips <= Decimal::ZERO || t.distance_pips < t.min_distance_pips {
            return fail("harvest.trailing distances inconsistent".into());
        }

        if self.execution.fill_timeout_ms == 0 {
            return fail("execution.fill_timeout_ms must be positive".into());
        }
        if self.correlation.window < 3 || self.correlation.min_samples < 2 {
            return fail("correlation.window/min_samples too small".into());
        }
        for seed in &self.correlation.seed {
            if !(-1.0..=1.0).contains(&seed.coefficient) {
                return fail(format!("correlation seed {}/{} out of [-1, 1]", seed.a, seed.b));
            }
        }
        Ok(())
    }
}
