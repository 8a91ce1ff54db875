// Reference worker: pop a job, run inference, publish the result to the job's
// response key.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::BrokerError;
use super::jobs::{self, Job, JobResult, WorkerError};

/// Consumer side of the broker
#[async_trait]
pub trait JobSource: Send + Sync {
    /// Next encoded job, or `None` if nothing arrived within the poll window
    async fn next_job(&self) -> Result<Option<Vec<u8>>, BrokerError>;

    async fn publish(&self, result: &JobResult) -> Result<(), BrokerError>;
}

/// The actual inference computation
#[async_trait]
pub trait Inference: Send + Sync {
    async fn infer(&self, job: &Job) -> Result<Value, WorkerError>;
}

pub struct Worker {
    source: Arc<dyn JobSource>,
    inference: Arc<dyn Inference>,
    error_backoff: Duration,
}

impl Worker {
    pub fn new(source: Arc<dyn JobSource>, inference: Arc<dyn Inference>) -> Self {
        Self {
            source,
            inference,
            error_backoff: Duration::from_secs(1),
        }
    }

    /// Run until `shutdown` flips to true.
    ///
    /// The flag is checked between pops, never raced against one, so a job
    /// already taken off the queue is always finished and published.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Worker started");

        while !*shutdown.borrow() {
            match self.source.next_job().await {
                Ok(Some(bytes)) => {
                    if let Err(err) = self.process_job(&bytes).await {
                        error!(error = %err, "Failed to publish result");
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    error!(error = %err, "Failed to pop job");
                    tokio::select! {
                        _ = tokio::time::sleep(self.error_backoff) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("Worker stopped");
    }

    /// Handle one encoded job end to end
    pub async fn process_job(&self, bytes: &[u8]) -> anyhow::Result<()> {
        let job = match jobs::decode(bytes) {
            Ok(job) => job,
            Err(err) => return self.reject(bytes, err).await,
        };

        info!(job_id = %job.id, "Processing job");

        let result = match self.inference.infer(&job).await {
            Ok(payload) => JobResult::success(job.id, payload),
            Err(failure) => {
                warn!(job_id = %job.id, error = %failure.message, "Inference failed");
                JobResult::failure(job.id, failure)
            }
        };

        self.source.publish(&result).await?;
        debug!(job_id = %job.id, "Result published");
        Ok(())
    }

    // A job we cannot decode still gets an answer if it names its id, so the
    // waiting caller fails fast instead of timing out.
    async fn reject(&self, bytes: &[u8], err: jobs::DecodeError) -> anyhow::Result<()> {
        let id = serde_json::from_slice::<Value>(bytes)
            .ok()
            .and_then(|value| value.get("id").and_then(Value::as_str).map(str::to_owned))
            .and_then(|id| Uuid::parse_str(&id).ok());

        let Some(job_id) = id else {
            warn!(error = %err, "Dropping undecodable job without an id");
            return Ok(());
        };

        warn!(job_id = %job_id, error = %err, "Rejecting undecodable job");
        let failure = WorkerError::new("Invalid job").with_details(err.to_string());
        self.source
            .publish(&JobResult::failure(job_id, failure))
            .await?;
        Ok(())
    }
}
