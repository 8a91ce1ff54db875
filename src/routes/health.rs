use axum::{extract::State, routing::get, Json, Router};

use crate::models::{AppState, Backend, BrokerReport, HealthResponse};

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .with_state(state)
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let broker_status = match &state.backend {
        Backend::Queue(broker) => BrokerReport::Status(broker.status()),
        Backend::Spawn(_) => BrokerReport::not_applicable(),
    };

    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        mode: state.backend.mode().to_string(),
        broker_status,
    })
}
