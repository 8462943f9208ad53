//! ComfyUI WebSocket message types and parser.
//!
//! ComfyUI sends JSON messages over WebSocket with the shape
//! `{"type": "<kind>", "data": {...}}`. This module deserializes them
//! into a strongly-typed [`ComfyUIMessage`] enum.

use serde::Deserialize;

/// ComfyUI WebSocket message types the relay understands.
///
/// Deserialized via the adjacently-tagged `"type"` field with associated
/// `"data"` content. Anything else (e.g. `progress_state`,
/// `execution_success`, custom node monitors) fails to parse and is
/// skipped by the dispatcher. Completion is `executing` with a `null`
/// node; `execution_success` arrives before the history record exists.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum ComfyUIMessage {
    /// Server status broadcast (queue depth, etc.).
    #[serde(rename = "status")]
    Status(StatusData),

    /// A prompt has started executing.
    #[serde(rename = "execution_start")]
    ExecutionStart(PromptRef),

    /// Some nodes were skipped because their outputs are cached.
    #[serde(rename = "execution_cached")]
    ExecutionCached(ExecutionCachedData),

    /// A specific node is currently executing (or execution finished when `node` is `None`).
    #[serde(rename = "executing")]
    Executing(ExecutingData),

    /// Progress update from a long-running node (e.g. KSampler).
    #[serde(rename = "progress")]
    Progress(ProgressData),

    /// A node has finished and produced output.
    #[serde(rename = "executed")]
    Executed(ExecutedData),

    /// Execution failed with an error.
    #[serde(rename = "execution_error")]
    ExecutionError(ErrorData),

    /// Execution was interrupted via `/interrupt`.
    #[serde(rename = "execution_interrupted")]
    ExecutionInterrupted(InterruptedData),
}

/// Queue status information.
#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
    /// Session id, only present on the first status after connecting.
    #[serde(default)]
    pub sid: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

/// Payload carrying only the prompt id.
#[derive(Debug, Clone, Deserialize)]
pub struct PromptRef {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    /// Node IDs whose outputs were served from cache.
    #[serde(default)]
    pub nodes: Vec<String>,
}

/// Payload for `executing` messages.
///
/// When `node` is `None`, execution of the prompt has completed.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    /// Older servers omit the prompt id on `executing` messages.
    #[serde(default)]
    pub prompt_id: Option<String>,
}

/// Payload for `progress` messages (step-level progress within a node).
#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

/// Payload for `executed` messages (node output).
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    /// Raw output value (images, filenames, etc.).
    #[serde(default)]
    pub output: serde_json::Value,
    pub prompt_id: String,
}

/// Payload for `execution_error` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_message: String,
    pub exception_type: String,
}

/// Payload for `execution_interrupted` messages.
#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub node_type: Option<String>,
}

/// Parse a ComfyUI WebSocket text message into a typed enum.
///
/// Returns `Err` for malformed JSON or unknown `type` values.
/// Callers should log unknown types and continue.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
