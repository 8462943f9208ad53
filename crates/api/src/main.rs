use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use relay_comfyui::api::{ComfyBackend, ComfyUIApi};
use relay_comfyui::client::ComfyUIClient;
use relay_comfyui::multiplexer::EventMultiplexer;
use relay_comfyui::reconnect::ReconnectConfig;
use relay_comfyui::registry::JobRegistry;
use relay_comfyui::shutdown::ShutdownCoordinator;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use relay_api::config::{LogFormat, ServerConfig};
use relay_api::router::build_app_router;
use relay_api::state::AppState;

/// How long startup waits for the first backend event connection.
const INITIAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Configuration ---
    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_tracing(LogFormat::Text);
            tracing::error!(error = %e, "Invalid configuration");
            std::process::exit(1);
        }
    };

    // --- Tracing ---
    init_tracing(config.log_format);
    tracing::info!(
        host = %config.host,
        port = %config.port,
        comfy_base_url = %config.comfy_base_url,
        comfy_ws_url = %config.comfy_ws_url,
        "Loaded server configuration",
    );
    if config.api_key.is_none() {
        tracing::warn!("COMFY_API_KEY is not set; API key authentication is disabled");
    }

    // --- Backend client ---
    let http = reqwest::Client::new();
    let backend: Arc<dyn ComfyBackend> = Arc::new(ComfyUIApi::with_client(
        http.clone(),
        config.comfy_base_url.clone(),
    ));

    // --- Event multiplexer ---
    let client_id = uuid::Uuid::new_v4().to_string();
    let connector = ComfyUIClient::new(config.comfy_ws_url.clone(), client_id.clone());
    let multiplexer = EventMultiplexer::start(connector, client_id, ReconnectConfig::default());
    if multiplexer.wait_connected(INITIAL_CONNECT_TIMEOUT).await {
        tracing::info!(client_id = %multiplexer.client_id(), "ComfyUI event stream connected");
    } else {
        tracing::warn!("ComfyUI event stream not connected yet; workflow requests fail until it is");
    }

    // --- Job bookkeeping ---
    let registry = Arc::new(JobRegistry::new());
    let coordinator = Arc::new(ShutdownCoordinator::new(
        Arc::clone(&backend),
        Arc::clone(&registry),
        config.shutdown_grace(),
    ));

    // --- App state ---
    let state = AppState {
        config: Arc::new(config.clone()),
        backend,
        multiplexer: Arc::clone(&multiplexer),
        registry,
        coordinator: Arc::clone(&coordinator),
        http,
    };

    let app = build_app_router(state, &config);

    // --- Start server ---
    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    tracing::info!(%addr, "Starting server");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(coordinator))
        .await
        .expect("Server error");

    // --- Post-shutdown cleanup ---
    tracing::info!("Server stopped accepting connections, cleaning up");

    multiplexer.shutdown().await;
    tracing::info!("Event multiplexer shut down");

    tracing::info!("Graceful shutdown complete");
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "relay_api=debug,relay_comfyui=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);

    match format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
    }
}

/// Wait for a termination signal, then cancel in-flight backend jobs
/// before letting the server drain.
///
/// Handles both SIGINT (Ctrl-C) and SIGTERM (on Unix).
async fn shutdown_signal(coordinator: Arc<ShutdownCoordinator>) {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        }
    }

    coordinator.run().await;
}
