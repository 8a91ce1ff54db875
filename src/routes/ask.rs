//! `POST /ask`
//!
//! Each request walks one path and produces exactly one response:
//!
//! ```text
//! Received ──no prompt──▶ 400
//!    │
//! Enqueuing ──BrokerError──▶ 500
//!    │
//! Awaiting ──payload──▶ 200
//!          ──error────▶ 500 (worker error verbatim)
//!          ──timeout──▶ 504 { jobId }
//!          ──BrokerError──▶ 500
//! ```
//!
//! In spawn mode `Enqueuing`/`Awaiting` collapse into a single worker process run.

use std::time::Duration;

use axum::{
    extract::{rejection::JsonRejection, State},
    routing::post,
    Json, Router,
};
use serde_json::Value;
use tracing::{debug, error, info, warn};

use crate::models::{AppState, AskRequest, Backend};
use crate::process::{ProcessError, ProcessExecutor};
use crate::queue::broker::{response_key, Delivery, JobBroker};
use crate::queue::jobs::{Job, Outcome};
use crate::types::{AppError, AppResult};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ask", post(ask))
        .with_state(state)
}

pub async fn ask(
    State(state): State<AppState>,
    body: Result<Json<AskRequest>, JsonRejection>,
) -> AppResult<Json<Value>> {
    let Json(request) = body.map_err(|rejection| AppError::BadBody(rejection.body_text()))?;

    let Some(prompt) = request.prompt() else {
        debug!("Rejected ask without a prompt");
        return Err(AppError::Validation("Prompt is required".to_string()));
    };

    let job = Job::new(prompt, request.options());

    match &state.backend {
        Backend::Queue(broker) => {
            ask_via_queue(broker.as_ref(), job, state.config.server.request_timeout()).await
        }
        Backend::Spawn(executor) => ask_via_process(executor, job).await,
    }
}

async fn ask_via_queue(broker: &dyn JobBroker, job: Job, timeout: Duration) -> AppResult<Json<Value>> {
    let job_id = job.id;
    let key = response_key(broker.queue_name(), job_id);

    broker.enqueue(&job).await.map_err(|err| {
        error!(job_id = %job_id, queue = broker.queue_name(), error = %err, "Failed to enqueue job");
        AppError::from(err)
    })?;
    info!(job_id = %job_id, queue = broker.queue_name(), response_key = %key, "Job enqueued");

    let delivery = broker.await_result(job_id, timeout).await.map_err(|err| {
        error!(job_id = %job_id, response_key = %key, error = %err, "Failed waiting for result");
        AppError::from(err)
    })?;

    match delivery {
        Delivery::Ready(result) => match result.outcome {
            Outcome::Payload(payload) => {
                info!(job_id = %job_id, response_key = %key, "Job completed");
                Ok(Json(payload))
            }
            Outcome::Error(err) => {
                warn!(job_id = %job_id, response_key = %key, error = %err.message, "Worker reported an error");
                Err(AppError::Upstream(err))
            }
        },
        Delivery::TimedOut => {
            warn!(job_id = %job_id, response_key = %key, timeout_ms = timeout.as_millis() as u64, "Job timed out");
            Err(AppError::Timeout { job_id })
        }
    }
}

async fn ask_via_process(executor: &ProcessExecutor, job: Job) -> AppResult<Json<Value>> {
    match executor.run(&job).await {
        Ok(payload) => {
            info!(job_id = %job.id, "Worker process completed");
            Ok(Json(payload))
        }
        Err(ProcessError::TimedOut(_)) => Err(AppError::Timeout { job_id: job.id }),
        Err(err) => {
            error!(job_id = %job.id, error = %err, "Worker process failed");
            Err(AppError::Process(err))
        }
    }
}
