// Shared helpers for driving the router in-process

#![allow(dead_code)]

use std::sync::Arc;

use axiom_gateway::config::{Config, ServerConfig, WorkerConfig};
use axiom_gateway::process::ProcessExecutor;
use axiom_gateway::queue::{Job, JobResult, JobSource, MemoryBroker, WorkerError};
use axiom_gateway::{create_router, AppState, Backend};
use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value;
use tokio::task::JoinHandle;
use tower::ServiceExt;

pub const QUEUE: &str = "adlm_queue";

pub fn config(request_timeout_ms: u64, worker: WorkerConfig) -> Config {
    Config {
        server: ServerConfig {
            port: 0,
            host: "127.0.0.1".to_string(),
            cors_allowed_origins: vec!["http://localhost:5173".to_string()],
            request_timeout_ms,
        },
        redis: None,
        worker,
    }
}

/// `sh -c <script> worker --prompt <text> [--grounding] ..`
pub fn sh_worker(script: &str, timeout_ms: u64) -> WorkerConfig {
    WorkerConfig {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string(), "worker".to_string()],
        timeout_ms,
        max_concurrent: 4,
    }
}

pub fn queue_app(broker: &MemoryBroker, request_timeout_ms: u64) -> Router {
    let state = AppState::new(
        config(request_timeout_ms, sh_worker("true", 1_000)),
        Backend::Queue(Arc::new(broker.clone())),
    );
    create_router(state)
}

pub fn spawn_app(script: &str, timeout_ms: u64) -> Router {
    let worker = sh_worker(script, timeout_ms);
    let executor = ProcessExecutor::new(&worker);
    create_router(AppState::new(config(5_000, worker), Backend::Spawn(executor)))
}

/// Stand-in worker: answers every job on the broker with `respond`
pub fn responder<F>(broker: &MemoryBroker, respond: F) -> JoinHandle<()>
where
    F: Fn(&Job) -> Result<Value, WorkerError> + Send + 'static,
{
    let broker = broker.clone();
    tokio::spawn(async move {
        while let Ok(job) = broker.dequeue().await {
            let result = match respond(&job) {
                Ok(payload) => JobResult::success(job.id, payload),
                Err(err) => JobResult::failure(job.id, err),
            };
            if broker.publish(&result).await.is_err() {
                break;
            }
        }
    })
}

pub async fn post_json(app: Router, uri: &str, body: &str) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    send(app, request).await
}

pub async fn get(app: Router, uri: &str) -> (StatusCode, Value) {
    let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(app, request).await
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, body)
}
