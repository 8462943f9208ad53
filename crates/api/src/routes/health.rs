use axum::extract::State;
use axum::{routing::get, Json, Router};
use serde::Serialize;

use crate::state::AppState;

/// Health check response payload.
#[derive(Serialize)]
pub struct HealthResponse {
    /// Overall service status.
    pub status: &'static str,
    /// Crate version from Cargo.toml.
    pub version: &'static str,
    /// Whether the backend event connection is up.
    pub backend_connected: bool,
    /// Jobs currently awaited by a request.
    pub in_flight_jobs: usize,
    /// Last queue depth broadcast by the backend.
    pub queue_remaining: Option<u32>,
    pub shutting_down: bool,
}

/// GET /health -- returns service and backend connection health.
async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let backend_connected = state.multiplexer.is_connected();

    let shutting_down = state.coordinator.is_triggered();

    let status = if shutting_down {
        "shutting_down"
    } else if backend_connected {
        "ok"
    } else {
        "degraded"
    };

    Json(HealthResponse {
        status,
        version: env!("CARGO_PKG_VERSION"),
        backend_connected,
        in_flight_jobs: state.registry.len(),
        queue_remaining: state.multiplexer.queue_remaining(),
        shutting_down,
    })
}

/// Mount health check routes (public, no API key).
pub fn router() -> Router<AppState> {
    Router::new().route("/health", get(health_check))
}
