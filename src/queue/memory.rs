//! In-process broker
//!
//! Same correlation protocol as the Redis broker, minus the network. Serves as
//! the substitute broker in tests and for running the worker loop locally.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use uuid::Uuid;

use super::broker::{await_registered, response_key, BrokerError, BrokerStatus, Delivery, JobBroker};
use super::jobs::{self, Job, JobResult};
use super::registry::WaitRegistry;
use super::workers::JobSource;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct MemoryBroker {
    queue_name: String,
    jobs: Arc<Mutex<VecDeque<Vec<u8>>>>,
    available: Arc<Notify>,
    registry: WaitRegistry,
    enqueued: Arc<AtomicUsize>,
    connected: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new(queue_name: impl Into<String>) -> Self {
        Self {
            queue_name: queue_name.into(),
            jobs: Arc::new(Mutex::new(VecDeque::new())),
            available: Arc::new(Notify::new()),
            registry: WaitRegistry::new(),
            enqueued: Arc::new(AtomicUsize::new(0)),
            connected: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Total number of jobs ever accepted
    pub fn enqueued_count(&self) -> usize {
        self.enqueued.load(Ordering::SeqCst)
    }

    /// Number of response keys still held (waiting or undelivered)
    pub fn pending_waits(&self) -> usize {
        self.registry.len()
    }

    /// Simulate losing (or regaining) the transport
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
        if !connected {
            self.registry.fail_all("memory broker disconnected");
        }
    }

    fn push(&self, bytes: Vec<u8>) {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(bytes);
        self.available.notify_one();
    }

    /// Pop the oldest job without waiting
    pub fn try_dequeue(&self) -> Option<Vec<u8>> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Wait until a job is available and decode it
    pub async fn dequeue(&self) -> Result<Job, BrokerError> {
        loop {
            if let Some(bytes) = self.try_dequeue() {
                return Ok(jobs::decode(&bytes)?);
            }
            self.available.notified().await;
        }
    }

    /// Publish raw bytes to a job's response key. Returns false if nobody
    /// holds that key any more.
    pub fn publish_raw(&self, job_id: Uuid, bytes: Vec<u8>) -> bool {
        self.registry
            .resolve(&response_key(&self.queue_name, job_id), bytes)
    }

    fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Disconnected("memory broker disconnected".to_string()))
        }
    }
}

#[async_trait]
impl JobBroker for MemoryBroker {
    async fn enqueue(&self, job: &Job) -> Result<(), BrokerError> {
        self.ensure_connected()?;

        let key = response_key(&self.queue_name, job.id);
        let registration = self
            .registry
            .register(&key)
            .ok_or(BrokerError::DuplicateJob(job.id))?;

        self.push(jobs::encode(job).map_err(BrokerError::Encode)?);
        self.enqueued.fetch_add(1, Ordering::SeqCst);
        registration.keep();
        Ok(())
    }

    async fn await_result(&self, job_id: Uuid, timeout: Duration) -> Result<Delivery, BrokerError> {
        // A disconnect after enqueue has already failed the slot through `fail_all`.
        await_registered(&self.registry, &self.queue_name, job_id, timeout).await
    }

    fn status(&self) -> BrokerStatus {
        if self.connected.load(Ordering::SeqCst) {
            BrokerStatus::connected(format!("in-memory queue {}", self.queue_name))
        } else {
            BrokerStatus::disconnected("memory broker disconnected")
        }
    }

    fn queue_name(&self) -> &str {
        &self.queue_name
    }
}

#[async_trait]
impl JobSource for MemoryBroker {
    async fn next_job(&self) -> Result<Option<Vec<u8>>, BrokerError> {
        self.ensure_connected()?;
        if let Some(bytes) = self.try_dequeue() {
            return Ok(Some(bytes));
        }
        let _ = tokio::time::timeout(POLL_INTERVAL, self.available.notified()).await;
        Ok(self.try_dequeue())
    }

    async fn publish(&self, result: &JobResult) -> Result<(), BrokerError> {
        self.ensure_connected()?;
        let bytes = jobs::encode_result(result).map_err(BrokerError::Encode)?;
        self.publish_raw(result.job_id, bytes);
        Ok(())
    }
}
