use std::sync::Arc;

use crate::counters::CounterAggregator;
use crate::rate_limit::VisitorRegistry;
use crate::sweeper::SweeperStatus;

// app's shared state, handed to handlers through axum's State extractor
pub struct AppState {
    pub registry: Arc<VisitorRegistry>,
    pub counters: Arc<CounterAggregator>,
    pub click_probability: f64, // chance a view also records a click
    pub sweepers: Vec<SweeperStatus>,
}
