use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::process::ProcessExecutor;
use crate::queue::broker::{BrokerStatus, JobBroker};
use crate::queue::jobs::JobOptions;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub backend: Backend,
}

/// Execution strategy behind `POST /ask`
#[derive(Clone)]
pub enum Backend {
    /// Enqueue on the shared broker and wait on the job's response key
    Queue(Arc<dyn JobBroker>),
    /// Spawn one worker process per request
    Spawn(ProcessExecutor),
}

impl Backend {
    pub fn mode(&self) -> &'static str {
        match self {
            Backend::Queue(_) => "queue",
            Backend::Spawn(_) => "spawn",
        }
    }
}

impl AppState {
    pub fn new(config: Config, backend: Backend) -> Self {
        Self {
            config: Arc::new(config),
            backend,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AskRequest {
    pub prompt: Option<String>,
    #[serde(default = "default_grounding")]
    pub enable_grounding: bool,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

fn default_grounding() -> bool {
    true
}

impl AskRequest {
    /// Trimmed-non-empty prompt, if any
    pub fn prompt(&self) -> Option<&str> {
        self.prompt.as_deref().filter(|p| !p.trim().is_empty())
    }

    pub fn options(&self) -> JobOptions {
        JobOptions {
            enable_grounding: self.enable_grounding,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: String,
    pub mode: String,
    pub broker_status: BrokerReport,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum BrokerReport {
    Status(BrokerStatus),
    NotApplicable(&'static str),
}

impl BrokerReport {
    pub fn not_applicable() -> Self {
        BrokerReport::NotApplicable("not applicable")
    }
}
