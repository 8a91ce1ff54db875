//! Job envelope codec
//!
//! Jobs and results travel through the broker as JSON documents:
//!
//! ```text
//! job:    { "id", "prompt", "options": { "enable_grounding", "max_tokens"?, "temperature"? }, "created_at" }
//! result: { "job_id", "payload" | "error": { "message", "details"? }, "produced_at" }
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Named inference parameters carried with every job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOptions {
    #[serde(default = "default_true")]
    pub enable_grounding: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
}

fn default_true() -> bool {
    true
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            enable_grounding: true,
            max_tokens: None,
            temperature: None,
        }
    }
}

/// A unit of inference work. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub prompt: String,
    #[serde(default)]
    pub options: JobOptions,
    pub created_at: DateTime<Utc>,
}

impl Job {
    /// Build a job with a fresh random identifier
    pub fn new(prompt: impl Into<String>, options: JobOptions) -> Self {
        Self {
            id: Uuid::new_v4(),
            prompt: prompt.into(),
            options,
            created_at: Utc::now(),
        }
    }
}

/// Domain-level failure reported by a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<Value>) -> Self {
        self.details = Some(details.into());
        self
    }
}

/// What a worker produced for a job: a payload or an error, never both
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Payload(Value),
    Error(WorkerError),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "ResultWire", into = "ResultWire")]
pub struct JobResult {
    pub job_id: Uuid,
    pub outcome: Outcome,
    pub produced_at: DateTime<Utc>,
}

impl JobResult {
    pub fn success(job_id: Uuid, payload: Value) -> Self {
        Self {
            job_id,
            outcome: Outcome::Payload(payload),
            produced_at: Utc::now(),
        }
    }

    pub fn failure(job_id: Uuid, error: WorkerError) -> Self {
        Self {
            job_id,
            outcome: Outcome::Error(error),
            produced_at: Utc::now(),
        }
    }
}

// Workers may omit `job_id` and `produced_at`; the response key already
// names the job.
#[derive(Serialize, Deserialize)]
struct ResultWire {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    job_id: Option<Uuid>,
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<WorkerError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    produced_at: Option<DateTime<Utc>>,
}

// Keeps `"payload": null` distinct from an absent payload.
fn present<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

impl TryFrom<ResultWire> for JobResult {
    type Error = DecodeError;

    fn try_from(wire: ResultWire) -> Result<Self, Self::Error> {
        let job_id = wire.job_id.ok_or(DecodeError::MissingJobId)?;
        let outcome = match (wire.payload, wire.error) {
            (Some(payload), None) => Outcome::Payload(payload),
            (None, Some(error)) => Outcome::Error(error),
            (Some(_), Some(_)) => return Err(DecodeError::Ambiguous),
            (None, None) => return Err(DecodeError::EmptyResult),
        };

        Ok(Self {
            job_id,
            outcome,
            produced_at: wire.produced_at.unwrap_or_else(Utc::now),
        })
    }
}

impl From<JobResult> for ResultWire {
    fn from(result: JobResult) -> Self {
        let (payload, error) = match result.outcome {
            Outcome::Payload(payload) => (Some(payload), None),
            Outcome::Error(error) => (None, Some(error)),
        };

        Self {
            job_id: Some(result.job_id),
            payload,
            error,
            produced_at: Some(result.produced_at),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Result carries both a payload and an error")]
    Ambiguous,

    #[error("Result carries neither a payload nor an error")]
    EmptyResult,

    #[error("Result does not name its job")]
    MissingJobId,
}

/// Encode a job for the shared queue
pub fn encode(job: &Job) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(job)
}

pub fn decode(bytes: &[u8]) -> Result<Job, DecodeError> {
    Ok(serde_json::from_slice(bytes)?)
}

pub fn encode_result(result: &JobResult) -> Result<Vec<u8>, serde_json::Error> {
    serde_json::to_vec(result)
}

/// Decode a self-describing result; `job_id` is required
pub fn decode_result(bytes: &[u8]) -> Result<JobResult, DecodeError> {
    // serde wraps TryFrom failures into its own error; surface ours directly.
    let wire: ResultWire = serde_json::from_slice(bytes)?;
    JobResult::try_from(wire)
}

/// Decode a result popped from `job_id`'s response key. A missing `job_id`
/// is taken from the key; a present one is kept so the caller can check it.
pub fn decode_result_for(job_id: Uuid, bytes: &[u8]) -> Result<JobResult, DecodeError> {
    let mut wire: ResultWire = serde_json::from_slice(bytes)?;
    wire.job_id.get_or_insert(job_id);
    JobResult::try_from(wire)
}
