//! HELIX: triangular FX arbitrage engine.
//!
//! Entry point. Loads configuration, initialises structured logging,
//! wires the engine to the paper broker, starts the dashboard API and the
//! snapshot writer, and runs the tick loop until Ctrl+C.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use helix::broker::paper::PaperBroker;
use helix::clock::SystemClock;
use helix::config::AppConfig;
use helix::dashboard::{self, DashboardState};
use helix::engine::events::MemorySink;
use helix::engine::Engine;
use helix::storage::{self, JsonlEventSink};

const BANNER: &str = r#"
 _   _ _____ _     _____  __
| | | | ____| |   |_ _\ \/ /
| |_| |  _| | |    | | \  /
|  _  | |___| |___ | | /  \
|_| |_|_____|_____|___/_/\_\

  Triangular arbitrage with correlated recovery
  v0.1.0
"#;

/// Events kept in memory for the dashboard.
const DASHBOARD_EVENTS: usize = 1_000;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (non-fatal if missing)
    let _ = dotenv::dotenv();

    let config_path = std::env::var("HELIX_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = if std::path::Path::new(&config_path).exists() {
        AppConfig::load(&config_path)?
    } else {
        let cfg = AppConfig::default();
        cfg.validate().context("Default configuration is invalid")?;
        cfg
    };

    init_logging();
    println!("{BANNER}");
    info!(
        engine = %cfg.engine.name,
        config = %config_path,
        tick_interval_ms = cfg.engine.tick_interval_ms,
        symbols = ?cfg.trading.symbols,
        "HELIX starting up"
    );

    // -- Broker ------------------------------------------------------------

    let broker = Arc::new(PaperBroker::new(
        cfg.paper.balance,
        cfg.engine.pip_value_per_lot,
        cfg.risk.margin_per_lot,
    ));
    let now = Utc::now();
    for symbol in &cfg.trading.symbols {
        match cfg.paper.initial_prices.get(symbol) {
            Some(mid) => broker.set_mid(symbol, *mid, cfg.paper.spread_pips, now),
            None => warn!(symbol = %symbol, "No initial paper price; symbol stays unquoted"),
        }
    }
    spawn_price_walk(broker.clone(), &cfg);

    // -- Engine ------------------------------------------------------------

    let memory = Arc::new(MemorySink::new(DASHBOARD_EVENTS));
    let event_log = Arc::new(JsonlEventSink::open(&cfg.storage.events_path)?);
    let mut engine = Engine::new(cfg.clone(), broker.clone(), broker.clone(), Arc::new(SystemClock))?
        .with_sink(memory.clone())
        .with_sink(event_log);

    let writer = tokio::spawn(storage::run_snapshot_writer(
        engine.subscribe(),
        cfg.storage.snapshot_path.clone(),
        cfg.storage.snapshot_every_ticks,
    ));

    if cfg.dashboard.enabled {
        let state = Arc::new(DashboardState::new(engine.subscribe(), memory).with_commands(engine.commands()));
        dashboard::spawn_dashboard(state, cfg.dashboard.port);
    }

    // -- Main loop -----------------------------------------------------------

    engine
        .run(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;

    let last = engine.snapshot();
    drop(engine);
    // the writer flushes the final snapshot once the engine's sender is gone
    if let Err(e) = writer.await {
        warn!(error = %e, "Snapshot writer did not finish cleanly");
    }

    info!(
        ticks = last.tick,
        live = last.triangles.len(),
        closed = last.history.len(),
        realized = %last.realized_profit.round_dp(2),
        floating = %last.floating_profit.round_dp(2),
        win_rate = %last.stats.win_rate,
        "HELIX shut down cleanly."
    );
    if !last.triangles.is_empty() {
        warn!(live = last.triangles.len(), "Triangles left open at shutdown");
    }
    Ok(())
}

/// Drive the paper broker's prices with a random walk.
fn spawn_price_walk(broker: Arc<PaperBroker>, cfg: &AppConfig) {
    let every = Duration::from_millis(cfg.engine.tick_interval_ms);
    let volatility = cfg.paper.volatility_pips;
    let spread = cfg.paper.spread_pips;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            broker.step_random_walk(volatility, spread, Utc::now());
        }
    });
}

/// Initialise the `tracing` subscriber.
fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("helix=info"));

    if std::env::var("HELIX_LOG_JSON").is_ok() {
        fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_thread_ids(true)
            .init();
    } else {
        fmt().with_env_filter(env_filter).with_target(true).init();
    }
}
