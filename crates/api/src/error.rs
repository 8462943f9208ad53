use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use relay_comfyui::error::JobError;
use relay_core::error::CoreError;
use serde_json::{json, Value};

/// Application-level error type for HTTP handlers.
///
/// Wraps [`CoreError`] for domain errors and [`JobError`] for job
/// outcomes, and adds HTTP-specific variants. Implements [`IntoResponse`]
/// to produce `{"error", "code", "details"?}` JSON bodies.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// A domain-level error from `relay_core`.
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A relayed job did not produce an artifact.
    #[error(transparent)]
    Job(#[from] JobError),

    /// A passthrough request could not reach the backend.
    #[error("Bad gateway: {0}")]
    BadGateway(String),

    /// The relay is shutting down and takes no new jobs.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// A bad request with a human-readable message.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// An internal error with a human-readable message.
    #[error("Internal error: {0}")]
    InternalError(String),
}

/// Convenience type alias for handler return values.
pub type AppResult<T> = Result<T, AppError>;

/// Client-facing description of an [`AppError`], shared by JSON responses
/// and stream `error` events.
#[derive(Debug, Clone)]
pub struct ErrorReport {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl AppError {
    pub fn report(&self) -> ErrorReport {
        let (status, code, message, details) = match self {
            // --- CoreError variants ---
            AppError::Core(core) => match core {
                CoreError::Validation(msg) => {
                    (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone(), None)
                }
                CoreError::Unauthorized(msg) => {
                    (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", msg.clone(), None)
                }
                CoreError::Forbidden(msg) => (StatusCode::FORBIDDEN, "FORBIDDEN", msg.clone(), None),
            },

            // --- Job outcomes ---
            AppError::Job(job) => classify_job_error(job),

            // --- HTTP-specific errors ---
            AppError::BadGateway(msg) => {
                tracing::warn!(error = %msg, "Passthrough request failed");
                (StatusCode::BAD_GATEWAY, "BACKEND_ERROR", msg.clone(), None)
            }
            AppError::Unavailable(msg) => {
                (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN", msg.clone(), None)
            }
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone(), None),
            AppError::InternalError(msg) => {
                tracing::error!(error = %msg, "Internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "INTERNAL_ERROR",
                    "An internal error occurred".to_string(),
                    None,
                )
            }
        };

        ErrorReport {
            status,
            code,
            message,
            details,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let report = self.report();

        let mut body = json!({
            "error": report.message,
            "code": report.code,
        });
        if let Some(details) = report.details {
            body["details"] = details;
        }

        (report.status, axum::Json(body)).into_response()
    }
}

/// Classify a job outcome into an HTTP status, error code, message and
/// optional structured details.
fn classify_job_error(err: &JobError) -> (StatusCode, &'static str, String, Option<Value>) {
    match err {
        JobError::SubmissionRejected { status, body } => {
            // The backend's validation payload is JSON; pass it through as-is.
            let details = serde_json::from_str::<Value>(body)
                .unwrap_or_else(|_| Value::String(body.clone()));
            (
                StatusCode::BAD_REQUEST,
                "SUBMISSION_REJECTED",
                format!("Workflow rejected by backend (HTTP {status})"),
                Some(details),
            )
        }
        JobError::Execution(failure) => {
            let message = match &failure.node_id {
                Some(node) => format!("Node {node} failed: {}", failure.exception_message),
                None => format!("Execution failed: {}", failure.exception_message),
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXECUTION_ERROR",
                message,
                serde_json::to_value(failure).ok(),
            )
        }
        JobError::ConnectionLost => (
            StatusCode::BAD_GATEWAY,
            "CONNECTION_LOST",
            err.to_string(),
            None,
        ),
        JobError::Timeout(_) => (StatusCode::GATEWAY_TIMEOUT, "TIMEOUT", err.to_string(), None),
        JobError::NoOutputFound(_) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "NO_OUTPUT",
            err.to_string(),
            None,
        ),
        JobError::Backend(msg) => {
            tracing::error!(error = %msg, "Backend error");
            (
                StatusCode::BAD_GATEWAY,
                "BACKEND_ERROR",
                "The generation backend returned an error".to_string(),
                None,
            )
        }
    }
}
