use axum::{Json, extract::State, http::StatusCode};
use std::sync::Arc;

use crate::models::{HealthResponse, SweeperHealth};
use crate::state::AppState;

// 503 once any sweeper has stopped; visitors/counters would grow without bound
pub async fn health_handler(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<HealthResponse>) {
    let sweepers: Vec<SweeperHealth> = state
        .sweepers
        .iter()
        .map(|s| SweeperHealth {
            name: s.name(),
            running: s.is_running(),
        })
        .collect();
    let healthy = sweepers.iter().all(|s| s.running);

    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" },
        timestamp: chrono::Utc::now().to_rfc3339(),
        visitors: state.registry.len(),
        sweepers,
    };
    let code = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(body))
}
