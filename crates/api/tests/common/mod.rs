#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response};
use axum::Router;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tower::ServiceExt;

use relay_api::config::{LogFormat, ServerConfig};
use relay_api::router::build_app_router;
use relay_api::state::AppState;
use relay_comfyui::api::{ComfyBackend, ComfyUIApiError, JobHistory, QueueStatus, SubmitResponse};
use relay_comfyui::client::{ComfyUIClientError, EventConnector, FrameStream};
use relay_comfyui::multiplexer::EventMultiplexer;
use relay_comfyui::reconnect::ReconnectConfig;
use relay_comfyui::registry::JobRegistry;
use relay_comfyui::shutdown::ShutdownCoordinator;
use relay_core::output::LocationClass;

pub const TEST_API_KEY: &str = "test-key";

/// Placeholder replaced by the real prompt id in scripted frames.
pub const PROMPT: &str = "{id}";

/// Build a test `ServerConfig` pointing at an address nothing listens on.
pub fn test_config() -> ServerConfig {
    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        comfy_base_url: "http://127.0.0.1:9".to_string(),
        comfy_ws_url: "ws://127.0.0.1:9".to_string(),
        api_key: Some(TEST_API_KEY.to_string()),
        cors_origins: vec!["http://localhost:5173".to_string()],
        job_timeout_secs: 30,
        shutdown_grace_secs: 1,
        log_format: LogFormat::Text,
    }
}

// ---------------------------------------------------------------------------
// Fake backend
// ---------------------------------------------------------------------------

/// What the fake backend does when a workflow is submitted.
#[derive(Debug, Clone)]
pub enum Script {
    /// Emit these event frames, with [`PROMPT`] replaced by the prompt id.
    Frames(Vec<String>),
    /// Close the event connection.
    DropConnection,
    /// Refuse the workflow with this status and body.
    Reject(u16, String),
    /// Accept the workflow and never report on it.
    Silent,
}

/// One event frame as the backend would send it.
pub fn frame(kind: &str, data: Value) -> String {
    json!({ "type": kind, "data": data }).to_string()
}

pub fn started() -> String {
    frame("execution_start", json!({ "prompt_id": PROMPT }))
}

pub fn executing(node: &str) -> String {
    frame("executing", json!({ "node": node, "prompt_id": PROMPT }))
}

pub fn progress(value: u32, max: u32, node: &str) -> String {
    frame(
        "progress",
        json!({ "value": value, "max": max, "prompt_id": PROMPT, "node": node }),
    )
}

pub fn executed(node: &str) -> String {
    frame(
        "executed",
        json!({ "node": node, "output": {}, "prompt_id": PROMPT }),
    )
}

pub fn finished() -> String {
    frame("executing", json!({ "node": null, "prompt_id": PROMPT }))
}

pub fn node_error(node: &str, message: &str) -> String {
    frame(
        "execution_error",
        json!({
            "prompt_id": PROMPT,
            "node_id": node,
            "node_type": "KSampler",
            "exception_message": message,
            "exception_type": "torch.OutOfMemoryError",
        }),
    )
}

/// In-memory backend driven by a [`Script`].
pub struct FakeBackend {
    events: Mutex<Option<fmpsc::UnboundedSender<String>>>,
    script: Script,
    outputs: Map<String, Value>,
    artifacts: HashMap<String, Bytes>,
    calls: Mutex<Vec<String>>,
}

impl FakeBackend {
    pub fn new(script: Script) -> Self {
        Self {
            events: Mutex::new(None),
            script,
            outputs: Map::new(),
            artifacts: HashMap::new(),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// History outputs reported for every prompt.
    pub fn with_outputs(mut self, outputs: Value) -> Self {
        self.outputs = outputs.as_object().cloned().unwrap_or_default();
        self
    }

    pub fn with_artifact(mut self, filename: &str, bytes: &'static [u8]) -> Self {
        self.artifacts
            .insert(filename.to_string(), Bytes::from_static(bytes));
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ComfyBackend for FakeBackend {
    async fn submit(
        &self,
        _workflow: &Value,
        _client_id: &str,
        prompt_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.record(format!("submit:{prompt_id}"));

        match &self.script {
            Script::Reject(status, body) => {
                return Err(ComfyUIApiError::SubmissionRejected {
                    status: *status,
                    body: body.clone(),
                })
            }
            Script::Frames(frames) => {
                if let Some(events) = self.events.lock().unwrap().as_ref() {
                    for frame in frames {
                        let _ = events.unbounded_send(frame.replace(PROMPT, prompt_id));
                    }
                }
            }
            Script::DropConnection => {
                self.events.lock().unwrap().take();
            }
            Script::Silent => {}
        }

        Ok(SubmitResponse {
            prompt_id: prompt_id.to_string(),
            number: 0,
        })
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<JobHistory, ComfyUIApiError> {
        self.record(format!("history:{prompt_id}"));
        Ok(JobHistory {
            outputs: self.outputs.clone(),
            status: None,
        })
    }

    async fn fetch_artifact(
        &self,
        filename: &str,
        _subfolder: &str,
        _location: LocationClass,
    ) -> Result<Bytes, ComfyUIApiError> {
        self.record(format!("view:{filename}"));
        self.artifacts
            .get(filename)
            .cloned()
            .ok_or_else(|| ComfyUIApiError::ApiError {
                status: 404,
                body: "not found".into(),
            })
    }

    async fn interrupt(&self, prompt_id: Option<&str>) -> Result<(), ComfyUIApiError> {
        self.record(format!("interrupt:{}", prompt_id.unwrap_or("*")));
        Ok(())
    }

    async fn delete_queued(&self, prompt_ids: &[String]) -> Result<(), ComfyUIApiError> {
        self.record(format!("delete:{}", prompt_ids.join(",")));
        Ok(())
    }

    async fn queue_status(&self) -> Result<QueueStatus, ComfyUIApiError> {
        Ok(QueueStatus::default())
    }
}

/// Event connector that serves exactly one channel-fed session.
struct ChannelConnector {
    session: Mutex<Option<fmpsc::UnboundedReceiver<String>>>,
}

#[async_trait]
impl EventConnector for ChannelConnector {
    async fn connect(&self) -> Result<FrameStream, ComfyUIClientError> {
        match self.session.lock().unwrap().take() {
            Some(rx) => Ok(rx.boxed()),
            None => Err(ComfyUIClientError::Connection("session closed".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// App
// ---------------------------------------------------------------------------

pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    pub backend: Arc<FakeBackend>,
}

impl TestApp {
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }

    pub async fn get(&self, uri: &str) -> Response<Body> {
        self.request(Request::get(uri).body(Body::empty()).unwrap())
            .await
    }

    /// POST a JSON body with the test API key.
    pub async fn post_json(&self, uri: &str, body: &Value) -> Response<Body> {
        let request = Request::post(uri)
            .header("content-type", "application/json")
            .header("x-api-key", TEST_API_KEY)
            .body(Body::from(body.to_string()))
            .unwrap();
        self.request(request).await
    }
}

pub async fn build_test_app(backend: FakeBackend) -> TestApp {
    build_test_app_with(test_config(), backend).await
}

/// Build the full application router with all middleware layers around a
/// fake backend and a channel-fed event connection.
pub async fn build_test_app_with(config: ServerConfig, backend: FakeBackend) -> TestApp {
    let (events_tx, events_rx) = fmpsc::unbounded();
    *backend.events.lock().unwrap() = Some(events_tx);
    let backend = Arc::new(backend);

    let connector = ChannelConnector {
        session: Mutex::new(Some(events_rx)),
    };
    let reconnect = ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(50),
        multiplier: 1.0,
    };
    let multiplexer = EventMultiplexer::start(connector, "test-client", reconnect);
    assert!(multiplexer.wait_connected(Duration::from_secs(1)).await);

    let registry = Arc::new(JobRegistry::new());
    let coordinator = Arc::new(ShutdownCoordinator::new(
        backend.clone(),
        Arc::clone(&registry),
        config.shutdown_grace(),
    ));

    let state = AppState {
        config: Arc::new(config.clone()),
        backend: backend.clone(),
        multiplexer,
        registry,
        coordinator,
        http: reqwest::Client::new(),
    };

    TestApp {
        router: build_app_router(state.clone(), &config),
        state,
        backend,
    }
}

// ---------------------------------------------------------------------------
// Response helpers
// ---------------------------------------------------------------------------

pub async fn body_bytes(response: Response<Body>) -> Bytes {
    response.into_body().collect().await.unwrap().to_bytes()
}

pub async fn body_json(response: Response<Body>) -> Value {
    serde_json::from_slice(&body_bytes(response).await).unwrap()
}

/// Split an SSE body into `(event name, JSON data)` pairs. Comment lines
/// (keep-alives) are skipped.
pub async fn sse_events(response: Response<Body>) -> Vec<(String, Value)> {
    let bytes = body_bytes(response).await;
    let text = String::from_utf8(bytes.to_vec()).unwrap();

    text.split("\n\n")
        .filter_map(|block| {
            let mut name = None;
            let mut data = None;
            for line in block.lines() {
                if let Some(value) = line.strip_prefix("event:") {
                    name = Some(value.trim().to_string());
                } else if let Some(value) = line.strip_prefix("data:") {
                    data = Some(serde_json::from_str(value.trim()).unwrap());
                }
            }
            Some((name?, data?))
        })
        .collect()
}
