use serde::Serialize;

use crate::counters::CounterRecord;

// Content categories the view handler picks from
pub const CATEGORIES: [&str; 4] = ["sports", "entertainment", "business", "education"];

// Response for /view
#[derive(Serialize, Debug, Clone)]
pub struct ViewResponse {
    pub category: String,
    pub window: String,
    pub clicked: bool,
}

// Response for /stats - counts not yet flushed
#[derive(Serialize, Debug, Clone)]
pub struct StatsResponse {
    pub entries: Vec<CounterRecord>,
    pub total_views: u64,
    pub total_clicks: u64,
}

#[derive(Serialize, Debug, Clone)]
pub struct SweeperHealth {
    pub name: &'static str,
    pub running: bool,
}

// Response for /health
#[derive(Serialize, Debug, Clone)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
    pub visitors: usize,
    pub sweepers: Vec<SweeperHealth>,
}
