pub mod health;

use axum::routing::{get, post};
use axum::Router;

use crate::handlers;
use crate::state::AppState;

/// Build the relay route tree.
///
/// ```text
/// /run_workflow          POST  run a workflow, respond with the artifact
/// /stream_workflow       POST  run a workflow, stream progress as SSE
/// /upload                POST  multipart upload forwarded to /upload/image
/// /ws                    GET   WebSocket passthrough (token query param)
/// *                      any   HTTP passthrough to the backend
/// ```
///
/// `/health` is mounted separately and needs no API key.
pub fn relay_routes() -> Router<AppState> {
    Router::new()
        .route("/run_workflow", post(handlers::workflow::run_workflow))
        .route("/stream_workflow", post(handlers::workflow::stream_workflow))
        .route("/upload", post(handlers::proxy::upload))
        .route("/ws", get(handlers::proxy::ws_passthrough))
        .fallback(handlers::proxy::passthrough)
}
