//! Handlers that run a workflow on the backend on behalf of the caller.
//!
//! Both endpoints submit through a [`JobCorrelator`]. `run_workflow`
//! blocks until the job is terminal and answers with the artifact bytes;
//! `stream_workflow` relays lifecycle and progress as server-sent events
//! and ends with a single `result` or `error` event.

use std::convert::Infallible;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures::Stream;
use relay_comfyui::correlator::JobCorrelator;
use relay_comfyui::error::JobError;
use relay_comfyui::resolver::OutputResolver;
use relay_core::error::CoreError;
use relay_core::job::{JobEvent, JobState, JobTracker};
use relay_core::output::{ArtifactSource, OutputArtifact};
use relay_core::workflow::validate_workflow_shape;
use serde_json::{json, Value};
use tokio::time::Instant;

use crate::error::{AppError, AppResult};
use crate::middleware::api_key::RequireApiKey;
use crate::state::AppState;

/// Interval between SSE keep-alive comments.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// POST /run_workflow
///
/// Responds with the selected artifact, `Content-Type` derived from its
/// kind and extension, and an attachment `Content-Disposition`.
pub async fn run_workflow(
    _key: RequireApiKey,
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Response> {
    ensure_accepting(&state)?;
    let workflow = parse_workflow(&body)?;

    let mut job = JobCorrelator::submit(
        state.backend.as_ref(),
        &state.multiplexer,
        &state.registry,
        &workflow,
    )
    .await?;
    job.wait(state.config.job_timeout()).await?;

    let resolved = OutputResolver::new(state.backend.as_ref())
        .resolve(job.prompt_id())
        .await?;

    tracing::info!(
        prompt_id = %job.prompt_id(),
        node_id = %resolved.artifact.node_id,
        filename = %resolved.filename(),
        media_type = resolved.media_type(),
        size = resolved.bytes.len(),
        "Returning workflow output",
    );

    Ok((
        [
            (header::CONTENT_TYPE, resolved.media_type().to_string()),
            (
                header::CONTENT_DISPOSITION,
                content_disposition(&resolved.filename()),
            ),
        ],
        resolved.bytes,
    )
        .into_response())
}

/// POST /stream_workflow
///
/// Malformed bodies are rejected with a plain JSON error before the stream
/// starts; everything after that is reported inside the stream.
pub async fn stream_workflow(
    _key: RequireApiKey,
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    ensure_accepting(&state)?;
    let workflow = parse_workflow(&body)?;

    let stream = async_stream::stream! {
        let submitted = JobCorrelator::submit(
            state.backend.as_ref(),
            &state.multiplexer,
            &state.registry,
            &workflow,
        )
        .await;
        let mut job = match submitted {
            Ok(job) => job,
            Err(e) => {
                yield Ok(error_event(&AppError::Job(e)));
                return;
            }
        };

        yield Ok(executing_event(job.prompt_id(), "submitted", None));
        yield Ok(executing_event(job.prompt_id(), "queued", None));

        let timeout = state.config.job_timeout();
        let deadline = Instant::now() + timeout;
        loop {
            let next = tokio::time::timeout_at(deadline, job.next_event()).await;
            match next {
                Ok(Some(event)) => {
                    if let Some(frame) = progress_event(job.prompt_id(), &event, job.tracker()) {
                        yield Ok(frame);
                    }
                }
                Ok(None) => break,
                Err(_) => {
                    job.expire(timeout);
                    break;
                }
            }
        }

        let outcome = job.outcome().unwrap_or(Err(JobError::ConnectionLost));
        let terminal = match outcome {
            Ok(()) => match OutputResolver::new(state.backend.as_ref()).select(job.prompt_id()).await {
                Ok(artifact) => result_event(job.prompt_id(), &artifact),
                Err(e) => error_event(&AppError::Job(e)),
            },
            Err(e) => error_event(&AppError::Job(e)),
        };
        yield Ok(terminal);
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL)))
}

fn ensure_accepting(state: &AppState) -> Result<(), AppError> {
    if state.coordinator.is_triggered() {
        return Err(AppError::Unavailable(
            "Relay is shutting down and accepts no new workflows".into(),
        ));
    }
    Ok(())
}

/// Decode the request body as a workflow graph.
fn parse_workflow(body: &[u8]) -> Result<Value, AppError> {
    let workflow: Value = serde_json::from_slice(body)
        .map_err(|e| CoreError::Validation(format!("Request body is not valid JSON: {e}")))?;
    validate_workflow_shape(&workflow)?;
    Ok(workflow)
}

/// `attachment; filename="..."` with characters that would break the
/// quoted string removed.
fn content_disposition(filename: &str) -> String {
    let safe: String = filename
        .chars()
        .filter(|c| !c.is_control() && *c != '"' && *c != '\\')
        .collect();
    format!("attachment; filename=\"{safe}\"")
}

// ---------------------------------------------------------------------------
// Stream events
// ---------------------------------------------------------------------------

fn sse(name: &'static str, payload: Value) -> Event {
    Event::default().event(name).data(payload.to_string())
}

fn executing_event(prompt_id: &str, state: &str, node: Option<&str>) -> Event {
    sse(
        "executing",
        json!({ "prompt_id": prompt_id, "state": state, "node": node }),
    )
}

/// Map a non-terminal job event to its stream event. Terminal events are
/// reported separately once the outcome is known.
fn progress_event(prompt_id: &str, event: &JobEvent, tracker: &JobTracker) -> Option<Event> {
    let frame = match event {
        JobEvent::Queued => executing_event(prompt_id, "queued", None),
        JobEvent::Started => executing_event(prompt_id, "started", None),
        JobEvent::Executing { node } => executing_event(prompt_id, "executing", Some(node.as_str())),
        JobEvent::NodeExecuted { node } => executing_event(prompt_id, "executed", Some(node.as_str())),
        JobEvent::Cached { nodes } => sse(
            "executing",
            json!({ "prompt_id": prompt_id, "state": "cached", "node": null, "nodes": nodes }),
        ),
        JobEvent::Progress { value, max, node } => {
            let node = node.clone().or_else(|| match tracker.state() {
                JobState::Executing { node } => node.clone(),
                _ => None,
            });
            sse(
                "progress",
                json!({
                    "prompt_id": prompt_id,
                    "value": value,
                    "max": max,
                    "node": node,
                    "percent": tracker.progress().percent(),
                }),
            )
        }
        JobEvent::Completed
        | JobEvent::Failed(_)
        | JobEvent::ConnectionLost
        | JobEvent::Status { .. } => return None,
    };
    Some(frame)
}

fn result_event(prompt_id: &str, artifact: &OutputArtifact) -> Event {
    let mut payload = json!({
        "prompt_id": prompt_id,
        "node_id": artifact.node_id,
        "filename": artifact.filename(),
        "kind": artifact.kind,
        "media_type": artifact.media_type(),
    });
    match &artifact.source {
        ArtifactSource::File(file) => {
            payload["subfolder"] = json!(file.subfolder);
            payload["type"] = json!(file.location);
        }
        ArtifactSource::Inline(text) => {
            payload["subfolder"] = json!("");
            payload["type"] = Value::Null;
            payload["text"] = json!(text);
        }
    }
    sse("result", payload)
}

fn error_event(err: &AppError) -> Event {
    let report = err.report();
    let mut payload = json!({ "code": report.code, "message": report.message });
    if let Some(details) = report.details {
        payload["details"] = details;
    }
    sse("error", payload)
}
