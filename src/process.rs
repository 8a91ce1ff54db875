//! Process-spawn execution path
//!
//! Used when no broker is configured: every ask runs one worker process,
//! whose output is read to completion before the request resolves.
//!
//! ```text
//! <program> <args..> --prompt <text> [--grounding] [--max-tokens N] [--temperature T]
//!     exit 0   + JSON on stdout  ──▶ payload
//!     exit 0   + anything else   ──▶ InvalidOutput (raw stdout attached)
//!     exit !0                    ──▶ Failed (exit code + stderr attached)
//! ```

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::config::WorkerConfig;
use crate::queue::jobs::{Job, WorkerError};
use crate::queue::workers::Inference;

/// Captured result of one worker run
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    /// -1 when the process was terminated by a signal
    pub exit_code: i32,
    pub duration_ms: u64,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Clone)]
pub struct ProcessExecutor {
    program: String,
    base_args: Vec<String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
}

impl ProcessExecutor {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            program: config.program.clone(),
            base_args: config.args.clone(),
            timeout: config.timeout(),
            permits: Arc::new(Semaphore::new(config.max_concurrent.max(1))),
        }
    }

    /// Full argument list for a job
    pub fn args_for(&self, job: &Job) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.push("--prompt".to_string());
        args.push(job.prompt.clone());
        if job.options.enable_grounding {
            args.push("--grounding".to_string());
        }
        if let Some(max_tokens) = job.options.max_tokens {
            args.push("--max-tokens".to_string());
            args.push(max_tokens.to_string());
        }
        if let Some(temperature) = job.options.temperature {
            args.push("--temperature".to_string());
            args.push(temperature.to_string());
        }
        args
    }

    /// Run the worker to completion and capture everything it wrote.
    ///
    /// The child is killed if the timeout elapses or the caller goes away.
    pub async fn execute(&self, job: &Job) -> Result<ProcessOutput, ProcessError> {
        let start = Instant::now();

        let mut cmd = Command::new(&self.program);
        cmd.args(self.args_for(job))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let run = async {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| ProcessError::Spawn(std::io::Error::other("worker pool closed")))?;
            debug!(job_id = %job.id, program = %self.program, "Spawning worker process");
            cmd.output().await.map_err(ProcessError::Spawn)
        };

        let output = match tokio::time::timeout(self.timeout, run).await {
            Ok(output) => output?,
            Err(_) => {
                warn!(job_id = %job.id, timeout_ms = self.timeout.as_millis() as u64, "Worker process timed out");
                return Err(ProcessError::TimedOut(self.timeout));
            }
        };

        Ok(ProcessOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    /// Run the worker and decode its standard output as the payload
    pub async fn run(&self, job: &Job) -> Result<Value, ProcessError> {
        let output = self.execute(job).await?;
        debug!(job_id = %job.id, exit_code = output.exit_code, duration_ms = output.duration_ms, "Worker process exited");

        if !output.success() {
            return Err(ProcessError::Failed {
                code: output.exit_code,
                stderr: output.stderr,
            });
        }

        serde_json::from_str(&output.stdout).map_err(|e| ProcessError::InvalidOutput {
            reason: e.to_string(),
            stdout: output.stdout,
        })
    }
}

#[async_trait]
impl Inference for ProcessExecutor {
    async fn infer(&self, job: &Job) -> Result<Value, WorkerError> {
        self.run(job).await.map_err(|err| err.to_worker_error())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to start worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("Worker process exited with code {code}")]
    Failed { code: i32, stderr: String },

    #[error("Worker output is not valid JSON: {reason}")]
    InvalidOutput { reason: String, stdout: String },

    #[error("Worker process timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
}

impl ProcessError {
    /// Response body describing this failure
    pub fn body(&self) -> Value {
        match self {
            ProcessError::Spawn(e) => json!({
                "error": "Failed to start worker process",
                "details": e.to_string(),
            }),
            ProcessError::Failed { code, stderr } => json!({
                "error": "Python process failed",
                "code": code,
                "details": stderr,
            }),
            ProcessError::InvalidOutput { reason, stdout } => json!({
                "error": "Failed to parse worker output",
                "details": reason,
                "output": stdout,
            }),
            ProcessError::TimedOut(timeout) => json!({
                "error": "Worker process timed out",
                "timeoutMs": timeout.as_millis() as u64,
            }),
        }
    }

    pub fn to_worker_error(&self) -> WorkerError {
        WorkerError::new(self.to_string()).with_details(self.body())
    }
}
