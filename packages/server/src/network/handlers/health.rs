//! Liveness, readiness and process health.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::{json, Value};

use super::AppState;

/// Liveness: the process answers.
pub async fn ping_handler() -> &'static str {
    "pong"
}

/// Readiness: 200 once the component is loaded, 503 while starting or
/// draining.
pub async fn ready_handler(State(state): State<AppState>) -> (StatusCode, &'static str) {
    if state.shutdown.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Process health as JSON. Always 200; `state` tells the truth.
pub async fn health_handler(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "state": state.shutdown.health_state().as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "uptime_secs": state.start_time.elapsed().as_secs(),
    }))
}
