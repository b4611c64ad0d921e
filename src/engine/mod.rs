//! Triangle lifecycle engine.
//!
//! A single control loop drives everything. Each tick:
//!
//! 1. collect fresh quotes for every configured symbol, and the broker's
//!    open positions
//! 2. sample mids into the returns window, refreshing correlations when due
//! 3. scan every triangle onto the opportunity board
//! 4. for each live instance: re-mark, reconcile against the broker, retry
//!    a pending close, emergency rules, recovery, then harvesting
//! 5. archive closed instances
//! 6. close orphaned legs left behind by failed units
//! 7. unless paused, pass ready opportunities through the execution gate,
//!    best first
//! 8. publish a snapshot
//!
//! Pausing stops new entries and new recovery layers. Open triangles keep
//! being marked, harvested and closed.
//!
//! Live instances are evaluated concurrently, each through its own `&mut`
//! borrow out of the registry, so two evaluations never share an instance
//! and a tick for one triangle is never reentrant.

pub mod events;
pub mod executor;
pub mod gate;
pub mod harvester;
pub mod recovery;
pub mod scanner;
pub mod snapshot;
pub mod tracker;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::broker::{AccountInfo, BrokerPosition, OrderGateway, PriceFeed};
use crate::clock::Clock;
use crate::config::{AppConfig, RiskConfig};
use crate::market::{CorrelationMatrix, CorrelationTable, QuoteBook, ReturnsWindow, TriangleCatalog};
use crate::strategy::{LotSizer, RiskManager};
use crate::types::{CloseReason, EngineError};

use events::{EngineEvent, EventBus, EventSink};
use executor::UnitExecutor;
use gate::ExecutionGate;
use harvester::{HarvestDecision, ProfitHarvester};
use recovery::{RecoveryDecision, RecoveryEngine};
use scanner::{Opportunity, OpportunityBoard, Scanner};
use snapshot::{CorrelationView, EngineSnapshot, EngineStats, TriangleView};
use tracker::{TriangleInstance, TriangleRegistry};

// ---------------------------------------------------------------------------
// Tick report
// ---------------------------------------------------------------------------

/// What one tick did.
#[derive(Debug)]
pub struct TickReport {
    pub tick: u64,
    pub at: DateTime<Utc>,
    pub scanned: usize,
    pub ready: usize,
    /// Triangles not scanned because a quote was stale or missing.
    pub skipped_triangles: usize,
    /// Live instances left untouched because a leg's quote was stale.
    pub stale_instances: usize,
    /// New order issuance suspended (broker disconnected).
    pub suspended: bool,
    pub paused: bool,
    pub opened: Vec<String>,
    pub gate_failures: Vec<(String, EngineError)>,
    pub recoveries: Vec<(String, u32)>,
    pub completed_recoveries: Vec<String>,
    pub harvests: Vec<(String, Vec<String>)>,
    pub closed: Vec<(String, CloseReason)>,
    /// Orphaned position ids closed this tick.
    pub orphans_closed: Vec<String>,
}

impl TickReport {
    fn new(tick: u64, at: DateTime<Utc>) -> Self {
        Self {
            tick,
            at,
            scanned: 0,
            ready: 0,
            skipped_triangles: 0,
            stale_instances: 0,
            suspended: false,
            paused: false,
            opened: Vec::new(),
            gate_failures: Vec::new(),
            recoveries: Vec::new(),
            completed_recoveries: Vec::new(),
            harvests: Vec::new(),
            closed: Vec::new(),
            orphans_closed: Vec::new(),
        }
    }

    /// Anything beyond a plain scan happened.
    pub fn is_eventful(&self) -> bool {
        !(self.opened.is_empty()
            && self.gate_failures.is_empty()
            && self.recoveries.is_empty()
            && self.completed_recoveries.is_empty()
            && self.harvests.is_empty()
            && self.closed.is_empty()
            && self.orphans_closed.is_empty())
    }
}

// ---------------------------------------------------------------------------
// Per-instance evaluation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct InstanceOutcome {
    stale: bool,
    recovery: Option<RecoveryDecision>,
    harvest: Option<HarvestDecision>,
}

/// Per-tick inputs shared by every instance evaluation.
struct TickContext<'a> {
    book: &'a QuoteBook,
    /// Broker positions by id; `None` when they could not be fetched.
    positions: Option<&'a HashMap<String, BrokerPosition>>,
    connected: bool,
    paused: bool,
    now: DateTime<Utc>,
}

/// Everything one instance evaluation needs, shared read-only across the
/// concurrent evaluations of a tick.
struct Lifecycle {
    recovery: RecoveryEngine,
    harvester: ProfitHarvester,
    events: EventBus,
    risk: Arc<RiskManager>,
    limits: RiskConfig,
    pip_value_per_lot: Decimal,
}

impl Lifecycle {
    async fn evaluate(&self, inst: &mut TriangleInstance, ctx: &TickContext<'_>) -> InstanceOutcome {
        let mut outcome = InstanceOutcome::default();
        let seen = inst.transitions.len();
        let now = ctx.now;

        if let Err(e) = inst.mark(ctx.book, self.pip_value_per_lot) {
            debug!(triangle = %inst.id, error = %e, "Instance skipped this tick");
            outcome.stale = true;
            return outcome;
        }
        if !ctx.connected {
            return outcome;
        }

        if let Some(positions) = ctx.positions {
            self.reconcile(inst, positions, now);
            if inst.is_flat() {
                warn!(triangle = %inst.id, "Every leg closed at the broker");
                let reason = inst.pending_close.unwrap_or(CloseReason::External);
                // no live legs: this only books the close
                let _ = self.harvester.close_all(inst, reason, &self.events, now).await;
                self.report_transitions(inst, seen);
                return outcome;
            }
        }

        if let Some(decision) = self.harvester.retry_pending_close(inst, &self.events, now).await {
            outcome.harvest = Some(decision);
            self.report_transitions(inst, seen);
            return outcome;
        }

        if let Some(reason) = self.emergency_reason(inst, now) {
            warn!(triangle = %inst.id, %reason, pips = %inst.aggregate_pips.round_dp(1), "Emergency close");
            // failures are reported as CloseFailed; the close stays pending
            let _ = self.harvester.close_all(inst, reason, &self.events, now).await;
            self.report_transitions(inst, seen);
            return outcome;
        }

        let recovery = if ctx.paused {
            self.recovery.try_complete(inst, &self.events, now).await
        } else {
            Some(self.recovery.evaluate(inst, ctx.book, &self.events, now).await)
        };
        let layer_opened = matches!(recovery, Some(RecoveryDecision::Opened { .. }));
        outcome.recovery = recovery;
        if !layer_opened {
            outcome.harvest = Some(self.harvester.evaluate(inst, &self.events, now).await);
        }

        self.report_transitions(inst, seen);
        outcome
    }

    /// Bring the instance in line with the broker and report what differed.
    fn reconcile(&self, inst: &mut TriangleInstance, positions: &HashMap<String, BrokerPosition>, now: DateTime<Utc>) {
        let result = inst.reconcile(positions);
        for (position_id, tracked, broker) in result.volumes {
            if broker < tracked {
                self.risk.release_lots(&inst.definition.id, tracked - broker);
            }
            self.events.emit(
                now,
                EngineEvent::PositionMismatch {
                    triangle_id: inst.id.clone(),
                    position_id,
                    tracked,
                    broker,
                },
            );
        }
        if let Some((cached, actual)) = result.pnl {
            self.events.emit(
                now,
                EngineEvent::PnlDivergence {
                    triangle_id: inst.id.clone(),
                    cached,
                    actual,
                },
            );
        }
    }

    fn emergency_reason(&self, inst: &TriangleInstance, now: DateTime<Utc>) -> Option<CloseReason> {
        if let Some(stop) = self.limits.emergency_stop_pips {
            if inst.aggregate_pips <= -stop {
                return Some(CloseReason::EmergencyStop);
            }
        }
        if let (Some(limit), Some(first)) = (self.recovery.config().max_recovery_duration(), inst.first_recovery_at) {
            if inst.has_live_recovery_legs() && now - first >= limit {
                return Some(CloseReason::RecoveryTimeout);
            }
        }
        if let Some(limit) = self.limits.max_triangle_age() {
            if inst.age(now) >= limit {
                return Some(CloseReason::MaxAge);
            }
        }
        None
    }

    /// Emit a `StateChanged` event for every transition logged since `seen`.
    fn report_transitions(&self, inst: &TriangleInstance, seen: usize) {
        for t in inst.transitions.iter().skip(seen) {
            self.events.emit(
                t.at,
                EngineEvent::StateChanged {
                    triangle_id: inst.id.clone(),
                    from: t.from,
                    to: t.to,
                    reason: t.reason.clone(),
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Operator commands, applied by the run loop between ticks.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineCommand {
    Pause,
    Resume,
    CloseAll,
    CloseTriangle(String),
}

/// Commands queued beyond this are refused.
const COMMAND_BUFFER: usize = 32;

pub struct Engine {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    feed: Arc<dyn PriceFeed>,
    gateway: Arc<dyn OrderGateway>,
    catalog: TriangleCatalog,
    scanner: Scanner,
    board: OpportunityBoard,
    gate: ExecutionGate,
    executor: Arc<UnitExecutor>,
    lifecycle: Lifecycle,
    risk: Arc<RiskManager>,
    correlations: Arc<CorrelationTable>,
    returns: ReturnsWindow,
    last_correlation_refresh: DateTime<Utc>,
    registry: TriangleRegistry,
    tick_count: u64,
    broker_connected: bool,
    paused: bool,
    stats: EngineStats,
    stale_symbols: Vec<String>,
    last_opportunities: Vec<Opportunity>,
    snapshot_tx: watch::Sender<EngineSnapshot>,
    command_tx: mpsc::Sender<EngineCommand>,
    command_rx: Option<mpsc::Receiver<EngineCommand>>,
}

impl Engine {
    pub fn new(
        config: AppConfig,
        feed: Arc<dyn PriceFeed>,
        gateway: Arc<dyn OrderGateway>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let catalog = TriangleCatalog::derive(&config.trading.symbols, &config.trading.anchor_currency);
        if catalog.is_empty() {
            return Err(EngineError::Config(format!(
                "no triangle can be formed from {:?}",
                config.trading.symbols
            )));
        }

        let now = clock.now();
        let pip_value = config.engine.pip_value_per_lot;
        let harvest_levels = config.harvest.levels.len();
        let sizer = Arc::new(LotSizer::new(config.sizing.clone()));
        let risk = Arc::new(RiskManager::new(config.risk.clone()));
        let executor = Arc::new(UnitExecutor::new(gateway.clone(), config.execution.fill_timeout()));
        let correlations = Arc::new(CorrelationTable::new(CorrelationMatrix::from_seeds(&config.correlation.seed)));

        let lifecycle = Lifecycle {
            recovery: RecoveryEngine::new(
                config.recovery.clone(),
                correlations.clone(),
                sizer.clone(),
                risk.clone(),
                executor.clone(),
                harvest_levels,
                pip_value,
            ),
            harvester: ProfitHarvester::new(
                config.harvest.clone(),
                executor.clone(),
                sizer.clone(),
                risk.clone(),
                pip_value,
            ),
            events: EventBus::new(),
            risk: risk.clone(),
            limits: config.risk.clone(),
            pip_value_per_lot: pip_value,
        };

        info!(
            engine = %config.engine.name,
            broker = %gateway.name(),
            triangles = catalog.len(),
            symbols = config.trading.symbols.len(),
            seeded_correlations = config.correlation.seed.len(),
            "Engine initialised"
        );

        let (snapshot_tx, _) = watch::channel(EngineSnapshot::empty(&config.engine.name, now));
        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        Ok(Self {
            scanner: Scanner::new(&config.trading),
            board: OpportunityBoard::default(),
            gate: ExecutionGate::new(executor.clone(), sizer, risk.clone(), harvest_levels),
            executor,
            returns: ReturnsWindow::new(config.correlation.window),
            registry: TriangleRegistry::new(config.engine.history_limit),
            last_correlation_refresh: now,
            tick_count: 0,
            broker_connected: true,
            paused: false,
            stats: EngineStats::default(),
            stale_symbols: Vec::new(),
            last_opportunities: Vec::new(),
            snapshot_tx,
            command_tx,
            command_rx: Some(command_rx),
            lifecycle,
            risk,
            correlations,
            catalog,
            clock,
            feed,
            gateway,
            config,
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.add_sink(sink);
        self
    }

    pub fn add_sink(&mut self, sink: Arc<dyn EventSink>) {
        self.lifecycle.events.add_sink(sink);
    }

    /// Receiver of the per-tick snapshot.
    pub fn subscribe(&self) -> watch::Receiver<EngineSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// Sender for operator commands; they take effect while `run` is looping.
    pub fn commands(&self) -> mpsc::Sender<EngineCommand> {
        self.command_tx.clone()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    pub fn registry(&self) -> &TriangleRegistry {
        &self.registry
    }

    pub fn catalog(&self) -> &TriangleCatalog {
        &self.catalog
    }

    pub fn risk(&self) -> &RiskManager {
        &self.risk
    }

    pub fn correlations(&self) -> Arc<CorrelationTable> {
        self.correlations.clone()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Stop opening triangles and recovery layers. Live triangles keep being
    /// managed.
    pub fn pause(&mut self) {
        if self.paused {
            return;
        }
        self.paused = true;
        info!(live = self.registry.len(), "Engine paused");
        self.lifecycle.events.emit(self.clock.now(), EngineEvent::EnginePaused);
    }

    pub fn resume(&mut self) {
        if !self.paused {
            return;
        }
        self.paused = false;
        info!("Engine resumed");
        self.lifecycle.events.emit(self.clock.now(), EngineEvent::EngineResumed);
    }

    /// Replace the correlation table wholesale (external batch source).
    pub fn update_correlations(&self, matrix: CorrelationMatrix) {
        let pairs = matrix.len();
        self.correlations.update(matrix);
        self.lifecycle.events.emit(self.clock.now(), EngineEvent::CorrelationsUpdated { pairs });
    }

    // -- Tick -------------------------------------------------------------------

    pub async fn tick(&mut self) -> TickReport {
        let now = self.clock.now();
        self.tick_count += 1;
        let mut report = TickReport::new(self.tick_count, now);

        self.check_connectivity(now);
        let connected = self.broker_connected;
        report.suspended = !connected;
        report.paused = self.paused;
        let positions = if connected { self.fetch_positions().await } else { None };

        let book = QuoteBook::collect(
            self.feed.as_ref(),
            &self.config.trading.symbols,
            now,
            self.config.quote_staleness(),
        )
        .await;
        for quote in book.iter() {
            self.returns.record(&quote.symbol, quote.mid(), quote.timestamp);
        }
        self.refresh_correlations(now);

        let scan = self.scanner.scan(&self.catalog, &book, &mut self.board, now);
        report.scanned = scan.scanned;
        report.ready = scan.ready;
        report.skipped_triangles = scan.skipped.len();

        // -- Live instances -----------------------------------------------------
        let lifecycle = &self.lifecycle;
        let ctx = TickContext {
            book: &book,
            positions: positions.as_ref(),
            connected,
            paused: self.paused,
            now,
        };
        let ctx_ref = &ctx;
        let outcomes = join_all(self.registry.iter_mut().map(move |inst| async move {
            let outcome = lifecycle.evaluate(inst, ctx_ref).await;
            (inst.id.clone(), outcome)
        }))
        .await;

        for (id, outcome) in outcomes {
            if outcome.stale {
                report.stale_instances += 1;
            }
            match outcome.recovery {
                Some(RecoveryDecision::Opened { layer }) => {
                    self.stats.recovery_layers_opened += 1;
                    report.recoveries.push((id.clone(), layer));
                }
                Some(RecoveryDecision::Completed { .. }) => {
                    self.stats.recoveries_completed += 1;
                    report.completed_recoveries.push(id.clone());
                }
                _ => {}
            }
            if let Some(HarvestDecision::Harvested { levels }) = outcome.harvest {
                if !levels.is_empty() {
                    self.stats.harvests += levels.len() as u64;
                    report.harvests.push((id, levels));
                }
            }
        }
        self.archive(&mut report);

        if let Some(positions) = &positions {
            self.sweep_orphans(positions, now, &mut report).await;
        }

        // -- New entries --------------------------------------------------------
        if connected && !self.paused {
            for opp in self.board.ready() {
                if self.registry.by_definition(&opp.triangle_id).is_some() {
                    continue;
                }
                let Some(def) = self.catalog.get(&opp.triangle_id) else {
                    continue;
                };
                match self.gate.open(def, &opp, &book, &self.lifecycle.events, now).await {
                    Ok(inst) => {
                        self.stats.triangles_opened += 1;
                        report.opened.push(inst.id.clone());
                        self.registry.insert(inst);
                    }
                    Err(e) => {
                        if !matches!(e, EngineError::DuplicateTriangle(_)) {
                            self.stats.entries_rejected += 1;
                        }
                        report.gate_failures.push((opp.triangle_id.clone(), e));
                    }
                }
            }
        }

        self.last_opportunities = self.board.all();
        self.board.clear();
        self.stale_symbols = book.stale_symbols().to_vec();
        self.publish(now).await;
        report
    }

    /// Close every leg of a live triangle.
    pub async fn close_triangle(&mut self, id: &str) -> Result<(), EngineError> {
        let now = self.clock.now();
        if !self.gateway.is_connected() {
            return Err(EngineError::BrokerUnavailable);
        }
        let inst = self
            .registry
            .get_mut(id)
            .ok_or_else(|| EngineError::TriangleNotFound(id.to_string()))?;

        info!(triangle = %id, "Manual close requested");
        let seen = inst.transitions.len();
        let result = self
            .lifecycle
            .harvester
            .close_all(inst, CloseReason::Manual, &self.lifecycle.events, now)
            .await;
        self.lifecycle.report_transitions(inst, seen);
        let mut report = TickReport::new(self.tick_count, now);
        self.archive(&mut report);
        self.publish(now).await;
        result
    }

    /// Pause the engine and close every live triangle.
    ///
    /// Returns the number of triangles closed. Triangles with a leg the broker
    /// refused to close stay live with the close pending; it is retried every
    /// tick and the first error is returned here.
    pub async fn close_all(&mut self) -> Result<usize, EngineError> {
        let now = self.clock.now();
        self.pause();
        if !self.gateway.is_connected() {
            return Err(EngineError::BrokerUnavailable);
        }
        info!(live = self.registry.len(), "Close all requested");

        let lifecycle = &self.lifecycle;
        let results = join_all(self.registry.iter_mut().map(move |inst| async move {
            let seen = inst.transitions.len();
            let result = lifecycle
                .harvester
                .close_all(inst, CloseReason::CloseAll, &lifecycle.events, now)
                .await;
            lifecycle.report_transitions(inst, seen);
            result
        }))
        .await;

        let mut report = TickReport::new(self.tick_count, now);
        self.archive(&mut report);
        self.publish(now).await;
        match results.into_iter().find_map(Result::err) {
            Some(e) => Err(e),
            None => Ok(report.closed.len()),
        }
    }

    /// Apply one operator command.
    pub async fn apply(&mut self, command: EngineCommand) -> Result<(), EngineError> {
        info!(?command, "Operator command");
        match command {
            EngineCommand::Pause => self.pause(),
            EngineCommand::Resume => self.resume(),
            EngineCommand::CloseAll => {
                self.close_all().await?;
            }
            EngineCommand::CloseTriangle(id) => self.close_triangle(&id).await?,
        }
        self.publish(self.clock.now()).await;
        Ok(())
    }

    /// Tick on `engine.tick_interval_ms` until `shutdown` resolves, applying
    /// operator commands between ticks.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        let mut interval = tokio::time::interval(Duration::from_millis(self.config.engine.tick_interval_ms));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tokio::pin!(shutdown);
        let mut commands = self.command_rx.take();

        info!(
            interval_ms = self.config.engine.tick_interval_ms,
            "Entering main loop. Press Ctrl+C to stop."
        );
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    log_tick(&report);
                }
                Some(command) = next_command(&mut commands) => {
                    if let Err(e) = self.apply(command).await {
                        warn!(error = %e, "Operator command failed");
                    }
                }
                _ = &mut shutdown => {
                    info!(ticks = self.tick_count, live = self.registry.len(), "Shutdown signal received");
                    break;
                }
            }
        }
        self.command_rx = commands;
    }

    // -- Internals --------------------------------------------------------------

    async fn fetch_positions(&self) -> Option<HashMap<String, BrokerPosition>> {
        match self.gateway.positions().await {
            Ok(list) => Some(list.into_iter().map(|p| (p.id.clone(), p)).collect()),
            Err(e) => {
                warn!(error = %e, "Broker positions unavailable; reconciliation skipped");
                None
            }
        }
    }

    /// Move closed instances to history, counting them.
    fn archive(&mut self, report: &mut TickReport) {
        for closed in self.registry.archive_closed() {
            self.stats.record_close(&closed);
            if let Some(reason) = closed.close_reason {
                report.closed.push((closed.id, reason));
            }
        }
    }

    /// Close every orphaned leg still open at the broker. An orphan the broker
    /// no longer reports was closed elsewhere and is released as is.
    async fn sweep_orphans(&self, positions: &HashMap<String, BrokerPosition>, now: DateTime<Utc>, report: &mut TickReport) {
        for orphan in self.risk.orphans() {
            let realized = if positions.contains_key(&orphan.position_id) {
                match self.executor.close_position(&orphan.position_id, Decimal::ONE).await {
                    Ok(realized) => realized,
                    Err(e) => {
                        warn!(position = %orphan.position_id, symbol = %orphan.symbol, error = %e, "Orphan close failed");
                        continue;
                    }
                }
            } else {
                Decimal::ZERO
            };
            self.risk.release_orphan(&orphan.position_id);
            info!(position = %orphan.position_id, symbol = %orphan.symbol, %realized, "Orphaned position closed");
            self.lifecycle.events.emit(
                now,
                EngineEvent::OrphanClosed {
                    definition_id: orphan.definition_id,
                    position_id: orphan.position_id.clone(),
                    symbol: orphan.symbol,
                    realized,
                },
            );
            report.orphans_closed.push(orphan.position_id);
        }
    }

    fn check_connectivity(&mut self, now: DateTime<Utc>) {
        let connected = self.gateway.is_connected();
        if connected == self.broker_connected {
            return;
        }
        self.broker_connected = connected;
        let event = if connected {
            EngineEvent::BrokerReconnected
        } else {
            EngineEvent::BrokerDisconnected
        };
        self.lifecycle.events.emit(now, event);
    }

    fn refresh_correlations(&mut self, now: DateTime<Utc>) {
        if now - self.last_correlation_refresh < self.config.correlation.refresh_interval() {
            return;
        }
        self.last_correlation_refresh = now;

        let computed = self.returns.compute(self.config.correlation.min_samples, now);
        if computed.is_empty() {
            debug!("Not enough samples for a correlation refresh");
            return;
        }
        // pairs without enough samples keep their previous (seeded) value
        let mut next = (*self.correlations.snapshot()).clone();
        next.merge(&computed);
        let pairs = computed.len();
        self.correlations.update(next);
        self.lifecycle.events.emit(now, EngineEvent::CorrelationsUpdated { pairs });
    }

    async fn publish(&self, now: DateTime<Utc>) {
        let account = if self.broker_connected {
            self.gateway.account().await.ok()
        } else {
            None
        };
        self.snapshot_tx.send_replace(self.build_snapshot(now, account));
    }

    fn build_snapshot(&self, now: DateTime<Utc>, account: Option<AccountInfo>) -> EngineSnapshot {
        let triangles: Vec<TriangleView> = self.registry.iter().map(TriangleView::from).collect();
        let correlations = self
            .correlations
            .snapshot()
            .iter()
            .map(|(a, b, coefficient)| CorrelationView {
                a: a.to_string(),
                b: b.to_string(),
                coefficient,
            })
            .collect();
        EngineSnapshot {
            engine: self.config.engine.name.clone(),
            tick: self.tick_count,
            taken_at: now,
            broker_connected: self.broker_connected,
            paused: self.paused,
            account,
            open_lots: self.risk.open_lots(),
            floating_profit: triangles.iter().map(|t| t.aggregate_profit).sum(),
            realized_profit: self
                .registry
                .iter()
                .chain(self.registry.history())
                .map(|t| t.realized_profit)
                .sum(),
            history: self.registry.history().map(TriangleView::from).collect(),
            triangles,
            opportunities: self.last_opportunities.clone(),
            stale_symbols: self.stale_symbols.clone(),
            correlations,
            orphans: self.risk.orphans(),
            stats: self.stats.clone(),
        }
    }
}

async fn next_command(rx: &mut Option<mpsc::Receiver<EngineCommand>>) -> Option<EngineCommand> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

fn log_tick(report: &TickReport) {
    if report.is_eventful() {
        info!(
            tick = report.tick,
            scanned = report.scanned,
            ready = report.ready,
            opened = report.opened.len(),
            gate_failures = report.gate_failures.len(),
            recoveries = report.recoveries.len(),
            completed_recoveries = report.completed_recoveries.len(),
            harvests = report.harvests.len(),
            closed = report.closed.len(),
            orphans_closed = report.orphans_closed.len(),
            "Tick complete"
        );
    } else {
        debug!(
            tick = report.tick,
            scanned = report.scanned,
            ready = report.ready,
            skipped = report.skipped_triangles,
            stale = report.stale_instances,
            suspended = report.suspended,
            paused = report.paused,
            "Tick complete"
        );
    }
}
