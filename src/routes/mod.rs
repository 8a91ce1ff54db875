//! HTTP routes
//!
//! - `POST /ask` - submit a prompt and wait for the worker's answer
//! - `GET /health` - liveness plus broker connectivity

pub mod ask;
pub mod health;

use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::middleware::cors_layer;
use crate::models::AppState;

pub fn create_router(state: AppState) -> Router {
    info!(mode = state.backend.mode(), "Creating application router");

    let cors = cors_layer(&state.config.server.cors_allowed_origins);

    Router::new()
        .merge(ask::router(state.clone()))
        .merge(health::router(state))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
