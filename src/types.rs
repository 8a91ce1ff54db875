// Request-handler error taxonomy and its HTTP mapping

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::process::ProcessError;
use crate::queue::broker::BrokerError;
use crate::queue::jobs::WorkerError;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Invalid request body: {0}")]
    BadBody(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Broker error: {0}")]
    Broker(#[source] BrokerError),

    #[error("Invalid worker response: {0}")]
    Decode(String),

    #[error("Worker reported an error: {}", .0.message)]
    Upstream(WorkerError),

    #[error("Job {job_id} timed out")]
    Timeout { job_id: Uuid },

    #[error("Process error: {0}")]
    Process(#[source] ProcessError),
}

pub type AppResult<T> = std::result::Result<T, AppError>;

impl From<BrokerError> for AppError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Decode(_) | BrokerError::Misrouted { .. } => AppError::Decode(err.to_string()),
            other => AppError::Broker(other),
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::BadBody(_) | AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            AppError::Broker(_)
            | AppError::Decode(_)
            | AppError::Upstream(_)
            | AppError::Process(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn body(&self) -> Value {
        match self {
            AppError::BadBody(details) => json!({
                "error": "Invalid request body",
                "details": details,
            }),
            AppError::Validation(message) => json!({ "error": message }),
            AppError::Broker(err) => json!({
                "error": "Internal server error",
                "details": err.to_string(),
            }),
            AppError::Decode(details) => json!({
                "error": "Invalid worker response",
                "details": details,
            }),
            // Worker-reported errors pass through as published
            AppError::Upstream(err) => json!({ "error": err }),
            AppError::Timeout { job_id } => json!({
                "error": "Request timeout",
                "jobId": job_id,
            }),
            AppError::Process(err) => err.body(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}
