//! Dashboard: JSON API over the engine snapshot, plus operator controls
//! (pause, resume, close all, close one triangle) that queue engine commands.
//!
//! CORS enabled for local development.

pub mod routes;

use axum::{
    http::{header, HeaderValue, Method},
    routing::{get, post},
    Router,
};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{error, info};

pub use routes::{AppState, DashboardState};

/// Start the dashboard web server in a background task.
pub fn spawn_dashboard(state: AppState, port: u16) -> JoinHandle<()> {
    let app = build_router(state);

    tokio::spawn(async move {
        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                error!(port, error = %e, "Failed to bind dashboard port");
                return;
            }
        };
        info!(port, "Dashboard API listening on http://localhost:{port}");
        if let Err(e) = axum::serve(listener, app).await {
            error!(error = %e, "Dashboard server error");
        }
    })
}

/// Build the Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(HeaderValue::from_static("*"))
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::CONTENT_TYPE]);

    Router::new()
        .route("/health", get(routes::health))
        .route("/api/snapshot", get(routes::get_snapshot))
        .route("/api/triangles", get(routes::get_triangles))
        .route("/api/triangles/:id", get(routes::get_triangle))
        .route("/api/triangles/:id/close", post(routes::close_triangle))
        .route("/api/events", get(routes::get_events))
        .route("/api/stats", get(routes::get_stats))
        .route("/api/control/pause", post(routes::control_pause))
        .route("/api/control/resume", post(routes::control_resume))
        .route("/api/control/close-all", post(routes::control_close_all))
        .layer(cors)
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
