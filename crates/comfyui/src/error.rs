//! Outcome errors for a single relayed job.

use std::time::Duration;

use relay_core::job::ExecutionFailure;

use crate::api::ComfyUIApiError;

/// Why a job did not produce an artifact.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The backend refused the workflow at submission time.
    #[error("Workflow rejected by backend ({status}): {body}")]
    SubmissionRejected { status: u16, body: String },

    /// A node raised during execution, or the backend interrupted the run.
    #[error("Execution failed: {}", .0.exception_message)]
    Execution(ExecutionFailure),

    /// The event connection dropped before a terminal event arrived.
    #[error("Connection to backend lost before the job finished")]
    ConnectionLost,

    /// No terminal event within the deadline.
    #[error("Job did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    /// The job completed but recorded nothing the relay can return.
    #[error("No output found for prompt {0}")]
    NoOutputFound(String),

    /// Transport or protocol failure talking to the backend.
    #[error("Backend error: {0}")]
    Backend(String),
}

impl From<ComfyUIApiError> for JobError {
    fn from(err: ComfyUIApiError) -> Self {
        match err {
            ComfyUIApiError::SubmissionRejected { status, body } => {
                JobError::SubmissionRejected { status, body }
            }
            other => JobError::Backend(other.to_string()),
        }
    }
}
