use axum::{Json, extract::State};
use rand::{Rng, seq::SliceRandom};
use std::sync::Arc;
use tracing::trace;

use crate::counters::MetricKey;
use crate::models::{CATEGORIES, ViewResponse};
use crate::state::AppState;

// Record a view for a random category in the current minute, sometimes a click too
pub async fn view_handler(State(state): State<Arc<AppState>>) -> Json<ViewResponse> {
    let (category, clicked) = {
        let mut rng = rand::thread_rng();
        let category = CATEGORIES.choose(&mut rng).copied().unwrap_or(CATEGORIES[0]);
        (category, rng.gen_bool(state.click_probability))
    };

    let key = MetricKey::for_minute(category, &chrono::Local::now());
    state.counters.record_view(&key);
    if clicked {
        state.counters.record_click(&key);
    }
    trace!(key = %key, clicked, "Recorded view");

    Json(ViewResponse {
        category: key.category().to_string(),
        window: key.window().to_string(),
        clicked,
    })
}
