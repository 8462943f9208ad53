//! In-memory doubles shared by the unit tests of this crate.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use relay_core::output::LocationClass;
use serde_json::{Map, Value};

use crate::api::{ComfyBackend, ComfyUIApiError, JobHistory, QueueStatus, SubmitResponse};
use crate::client::{ComfyUIClientError, EventConnector, FrameStream};
use crate::multiplexer::EventMultiplexer;
use crate::reconnect::ReconnectConfig;

/// Hands out one pre-built frame stream per connect call, then fails.
pub struct ScriptedConnector {
    sessions: Mutex<VecDeque<fmpsc::UnboundedReceiver<String>>>,
}

#[async_trait]
impl EventConnector for ScriptedConnector {
    async fn connect(&self) -> Result<FrameStream, ComfyUIClientError> {
        match self.sessions.lock().unwrap().pop_front() {
            Some(rx) => Ok(rx.boxed()),
            None => Err(ComfyUIClientError::Connection("no more sessions".into())),
        }
    }
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

/// Start a multiplexer over `sessions` scripted connections and wait for
/// the first one to come up.
pub async fn start_multiplexer(
    sessions: usize,
) -> (Arc<EventMultiplexer>, Vec<fmpsc::UnboundedSender<String>>) {
    let mut senders = Vec::new();
    let mut receivers = VecDeque::new();
    for _ in 0..sessions {
        let (tx, rx) = fmpsc::unbounded();
        senders.push(tx);
        receivers.push_back(rx);
    }
    let connector = ScriptedConnector {
        sessions: Mutex::new(receivers),
    };
    let mux = EventMultiplexer::start(connector, "test-client", fast_reconnect());
    assert!(mux.wait_connected(Duration::from_secs(1)).await);
    (mux, senders)
}

pub fn send_frame(tx: &fmpsc::UnboundedSender<String>, json: &str) {
    tx.unbounded_send(json.to_string()).unwrap();
}

pub async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

/// Backend double that records every call.
#[derive(Default)]
pub struct StubBackend {
    /// Answer submissions with this id instead of the requested one.
    pub assigned_id: Option<String>,
    /// Refuse submissions with this status and body.
    pub reject: Option<(u16, String)>,
    /// History outputs keyed by prompt id.
    pub outputs: Mutex<HashMap<String, Map<String, Value>>>,
    /// Artifact bytes keyed by filename.
    pub artifacts: Mutex<HashMap<String, Bytes>>,
    /// Queue snapshots returned in order; idle once exhausted.
    pub queue: Mutex<VecDeque<QueueStatus>>,
    pub calls: Mutex<Vec<String>>,
}

impl StubBackend {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn record(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl ComfyBackend for StubBackend {
    async fn submit(
        &self,
        _workflow: &Value,
        _client_id: &str,
        prompt_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        self.record(format!("submit:{prompt_id}"));
        if let Some((status, body)) = &self.reject {
            return Err(ComfyUIApiError::SubmissionRejected {
                status: *status,
                body: body.clone(),
            });
        }
        Ok(SubmitResponse {
            prompt_id: self
                .assigned_id
                .clone()
                .unwrap_or_else(|| prompt_id.to_string()),
            number: 1,
        })
    }

    async fn fetch_history(&self, prompt_id: &str) -> Result<JobHistory, ComfyUIApiError> {
        self.record(format!("history:{prompt_id}"));
        let outputs = self
            .outputs
            .lock()
            .unwrap()
            .get(prompt_id)
            .cloned()
            .ok_or_else(|| ComfyUIApiError::NotFound(prompt_id.to_string()))?;
        Ok(JobHistory {
            outputs,
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
            .lock()
            .unwrap()
            .get(filename)
            .cloned()
            .ok_or_else(|| ComfyUIApiError::ApiError {
                status: 404,
                body: "missing".into(),
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
        Ok(self.queue.lock().unwrap().pop_front().unwrap_or_default())
    }
}
