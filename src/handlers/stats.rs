use axum::{Json, extract::State};
use std::sync::Arc;

use crate::models::StatsResponse;
use crate::state::AppState;

// Counts recorded since the last flush
pub async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    let entries = state.counters.peek().records();
    let total_views = entries.iter().map(|r| r.views).sum();
    let total_clicks = entries.iter().map(|r| r.clicks).sum();

    Json(StatsResponse {
        entries,
        total_views,
        total_clicks,
    })
}
