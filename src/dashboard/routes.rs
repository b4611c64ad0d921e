//! Dashboard API route handlers.
//!
//! Read endpoints return JSON built from the latest published snapshot.
//! Control endpoints only queue an `EngineCommand`; the engine applies it
//! between ticks and the effect shows up in a later snapshot.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use crate::engine::events::{EventRecord, MemorySink};
use crate::engine::snapshot::{EngineSnapshot, EngineStats, TriangleView};
use crate::engine::EngineCommand;
use crate::types::TriangleState;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub struct DashboardState {
    pub snapshot: watch::Receiver<EngineSnapshot>,
    pub events: Arc<MemorySink>,
    /// Absent when the dashboard runs read-only.
    pub commands: Option<mpsc::Sender<EngineCommand>>,
    pub started_at: DateTime<Utc>,
}

impl DashboardState {
    pub fn new(snapshot: watch::Receiver<EngineSnapshot>, events: Arc<MemorySink>) -> Self {
        Self {
            snapshot,
            events,
            commands: None,
            started_at: Utc::now(),
        }
    }

    pub fn with_commands(mut self, commands: mpsc::Sender<EngineCommand>) -> Self {
        self.commands = Some(commands);
        self
    }

    fn latest(&self) -> EngineSnapshot {
        self.snapshot.borrow().clone()
    }
}

pub type AppState = Arc<DashboardState>;

// ---------------------------------------------------------------------------
// Response types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub engine: String,
    pub tick: u64,
    pub broker_connected: bool,
    pub paused: bool,
    pub live_triangles: usize,
    pub open_lots: Decimal,
    pub uptime_secs: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlResponse {
    pub queued: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct TriangleQuery {
    /// Filter by state, e.g. `Recovering`.
    pub state: Option<TriangleState>,
    /// Include closed triangles from history.
    #[serde(default)]
    pub include_closed: bool,
}

#[derive(Debug, Deserialize)]
pub struct EventQuery {
    #[serde(default = "default_event_limit")]
    pub limit: usize,
    pub triangle: Option<String>,
}

fn default_event_limit() -> usize {
    100
}

// ---------------------------------------------------------------------------
// Route handlers
// ---------------------------------------------------------------------------

/// GET /health
pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let snapshot = state.latest();
    Json(HealthResponse {
        status: "ok",
        engine: snapshot.engine,
        tick: snapshot.tick,
        broker_connected: snapshot.broker_connected,
        paused: snapshot.paused,
        live_triangles: snapshot.triangles.len(),
        open_lots: snapshot.open_lots,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
    })
}

/// GET /api/snapshot
pub async fn get_snapshot(State(state): State<AppState>) -> Json<EngineSnapshot> {
    Json(state.latest())
}

/// GET /api/triangles
pub async fn get_triangles(
    State(state): State<AppState>,
    Query(query): Query<TriangleQuery>,
) -> Json<Vec<TriangleView>> {
    let snapshot = state.latest();
    let mut triangles = snapshot.triangles;
    if query.include_closed {
        triangles.extend(snapshot.history);
    }
    if let Some(wanted) = query.state {
        triangles.retain(|t| t.state == wanted);
    }
    Json(triangles)
}

/// GET /api/triangles/:id
pub async fn get_triangle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TriangleView>, StatusCode> {
    let snapshot = state.latest();
    snapshot
        .triangles
        .into_iter()
        .chain(snapshot.history)
        .find(|t| t.id == id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

/// GET /api/events
pub async fn get_events(State(state): State<AppState>, Query(query): Query<EventQuery>) -> Json<Vec<EventRecord>> {
    let limit = query.limit.min(1_000);
    let events = match query.triangle {
        Some(id) => state
            .events
            .all()
            .into_iter()
            .rev()
            .filter(|r| r.event.triangle_id() == Some(id.as_str()))
            .take(limit)
            .collect(),
        None => state.events.recent(limit),
    };
    Json(events)
}

/// GET /api/stats
pub async fn get_stats(State(state): State<AppState>) -> Json<EngineStats> {
    Json(state.latest().stats)
}

/// POST /api/control/pause
pub async fn control_pause(State(state): State<AppState>) -> Result<Json<ControlResponse>, StatusCode> {
    queue(&state, EngineCommand::Pause).await
}

/// POST /api/control/resume
pub async fn control_resume(State(state): State<AppState>) -> Result<Json<ControlResponse>, StatusCode> {
    queue(&state, EngineCommand::Resume).await
}

/// POST /api/control/close-all
pub async fn control_close_all(State(state): State<AppState>) -> Result<Json<ControlResponse>, StatusCode> {
    queue(&state, EngineCommand::CloseAll).await
}

/// POST /api/triangles/:id/close
pub async fn close_triangle(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ControlResponse>, StatusCode> {
    if state.latest().triangle(&id).is_none() {
        return Err(StatusCode::NOT_FOUND);
    }
    queue(&state, EngineCommand::CloseTriangle(id)).await
}

async fn queue(state: &DashboardState, command: EngineCommand) -> Result<Json<ControlResponse>, StatusCode> {
    let Some(commands) = &state.commands else {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    };
    let queued = format!("{command:?}");
    match commands.send(command).await {
        Ok(()) => {
            info!(command = %queued, "Command queued via API");
            Ok(Json(ControlResponse { queued }))
        }
        Err(e) => {
            warn!(error = %e, "Engine is not accepting commands");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
