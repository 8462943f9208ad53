use std::sync::Arc;

use relay_comfyui::api::ComfyBackend;
use relay_comfyui::multiplexer::EventMultiplexer;
use relay_comfyui::registry::JobRegistry;
use relay_comfyui::shutdown::ShutdownCoordinator;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// This is cheaply cloneable (inner data is behind `Arc` or is already `Clone`).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Backend REST client.
    pub backend: Arc<dyn ComfyBackend>,
    /// The process-wide backend event connection.
    pub multiplexer: Arc<EventMultiplexer>,
    /// Jobs currently awaited by a request.
    pub registry: Arc<JobRegistry>,
    pub coordinator: Arc<ShutdownCoordinator>,
    /// HTTP client used by the passthrough routes.
    pub http: reqwest::Client,
}
