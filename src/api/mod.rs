//! REST API over a completed replay.
//!
//! Provides two GET endpoints:
//! - `/state` - scenario summary, KPI report, and latest tick
//! - `/telemetry` - tick records with optional range filtering

mod handlers;
mod types;

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::routing::get;
use tracing::info;

use crate::sim::kpi::KpiReport;
use crate::sim::types::TickRecord;

pub use types::ScenarioSummary;

/// Read-only state shared across all request handlers.
///
/// Built once after the replay completes, so handlers need no locks.
pub struct AppState {
    pub scenario: ScenarioSummary,
    pub kpi: KpiReport,
    pub results: Vec<TickRecord>,
}

/// Builds the axum router with all API routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/state", get(handlers::get_state))
        .route("/telemetry", get(handlers::get_telemetry))
        .with_state(state)
}

/// Binds to `addr` and serves the API until the server stops.
///
/// # Errors
///
/// Returns an `io::Error` if the listener cannot bind or the server fails.
pub async fn serve(state: Arc<AppState>, addr: SocketAddr) -> io::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "API server listening");
    axum::serve(listener, app).await
}
