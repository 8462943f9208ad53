//! Normalization of raw ComfyUI messages into per-job events.
//!
//! The dispatcher only needs two things from a message: which prompt it
//! belongs to (if any) and what it means for that prompt's lifecycle.

use relay_core::job::{ExecutionFailure, JobEvent, EXCEPTION_INTERRUPTED};

use crate::messages::ComfyUIMessage;

/// A [`JobEvent`] tagged with the prompt it belongs to.
///
/// `prompt_id` is `None` for broadcasts and for progress frames from
/// servers that do not tag them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedEvent {
    pub prompt_id: Option<String>,
    pub event: JobEvent,
}

impl From<ComfyUIMessage> for RoutedEvent {
    fn from(msg: ComfyUIMessage) -> Self {
        let (prompt_id, event) = match msg {
            ComfyUIMessage::Status(data) => (
                None,
                JobEvent::Status {
                    queue_remaining: data.status.exec_info.queue_remaining,
                },
            ),
            ComfyUIMessage::ExecutionStart(data) => (Some(data.prompt_id), JobEvent::Started),
            ComfyUIMessage::ExecutionCached(data) => {
                (Some(data.prompt_id), JobEvent::Cached { nodes: data.nodes })
            }
            // `node: null` is the backend's "all work done" signal.
            ComfyUIMessage::Executing(data) => match data.node {
                Some(node) => (data.prompt_id, JobEvent::Executing { node }),
                None => (data.prompt_id, JobEvent::Completed),
            },
            ComfyUIMessage::Progress(data) => (
                data.prompt_id,
                JobEvent::Progress {
                    value: data.value,
                    max: data.max,
                    node: data.node,
                },
            ),
            ComfyUIMessage::Executed(data) => (
                Some(data.prompt_id),
                JobEvent::NodeExecuted { node: data.node },
            ),
            ComfyUIMessage::ExecutionError(data) => (
                Some(data.prompt_id),
                JobEvent::Failed(ExecutionFailure {
                    node_id: data.node_id,
                    node_type: data.node_type,
                    exception_type: data.exception_type,
                    exception_message: data.exception_message,
                }),
            ),
            ComfyUIMessage::ExecutionInterrupted(data) => (
                Some(data.prompt_id),
                JobEvent::Failed(ExecutionFailure {
                    node_id: data.node_id,
                    node_type: data.node_type,
                    exception_type: EXCEPTION_INTERRUPTED.to_string(),
                    exception_message: "Execution interrupted".to_string(),
                }),
            ),
        };

        RoutedEvent { prompt_id, event }
    }
}
