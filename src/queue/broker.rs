//! Correlation broker contract
//!
//! A producer pushes an encoded [`Job`] onto a shared FIFO queue and then waits
//! on a response key that only that job's result is ever published to:
//!
//! ```text
//! <queueName>                     LPUSH job ──▶ worker pops
//! <queueName>:response:<jobId>    worker pushes result ──▶ waiter pops once
//! ```

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

use super::jobs::{self, DecodeError, Job, JobResult};
use super::registry::WaitRegistry;

/// Outcome of waiting on a response key
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    Ready(JobResult),
    TimedOut,
}

/// Connectivity snapshot, cheap to read at any time
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BrokerStatus {
    pub connected: bool,
    pub detail: String,
}

impl BrokerStatus {
    pub fn connected(detail: impl Into<String>) -> Self {
        Self {
            connected: true,
            detail: detail.into(),
        }
    }

    pub fn disconnected(detail: impl Into<String>) -> Self {
        Self {
            connected: false,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait JobBroker: Send + Sync {
    /// Push a job onto the shared queue. The job's response key is subscribable
    /// by the time this returns. No internal retry.
    async fn enqueue(&self, job: &Job) -> Result<(), BrokerError>;

    /// Wait up to `timeout` for the result of a previously enqueued job
    async fn await_result(&self, job_id: Uuid, timeout: Duration) -> Result<Delivery, BrokerError>;

    /// Non-blocking connectivity report
    fn status(&self) -> BrokerStatus;

    fn queue_name(&self) -> &str;
}

/// Response key for a job: `<queue>:response:<jobId>`
pub fn response_key(queue: &str, job_id: Uuid) -> String {
    format!("{}:response:{}", queue, job_id)
}

/// Shared await path for brokers backed by a [`WaitRegistry`]
pub(crate) async fn await_registered(
    registry: &WaitRegistry,
    queue: &str,
    job_id: Uuid,
    timeout: Duration,
) -> Result<Delivery, BrokerError> {
    let key = response_key(queue, job_id);

    let Some(bytes) = registry.wait(&key, timeout).await? else {
        return Ok(Delivery::TimedOut);
    };

    let result = jobs::decode_result_for(job_id, &bytes)?;
    if result.job_id != job_id {
        return Err(BrokerError::Misrouted {
            expected: job_id,
            got: result.job_id,
        });
    }

    Ok(Delivery::Ready(result))
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Broker disconnected: {0}")]
    Disconnected(String),

    #[error("Job {0} is already pending")]
    DuplicateJob(Uuid),

    #[error("No pending wait for {0}")]
    NotPending(String),

    #[error("Failed to encode envelope: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Undecodable result: {0}")]
    Decode(#[from] DecodeError),

    #[error("Result for job {got} delivered on the response key of job {expected}")]
    Misrouted { expected: Uuid, got: Uuid },
}
