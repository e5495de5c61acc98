use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, TextEncoder, opts, register_counter, register_counter_vec,
    register_gauge,
};

lazy_static! {
    pub static ref REQUESTS_ADMITTED: Counter =
        register_counter!("gateway_requests_admitted_total", "Requests let through by the rate limiter")
            .expect("register gateway_requests_admitted_total");
    pub static ref REQUESTS_REJECTED: Counter =
        register_counter!("gateway_requests_rate_limited_total", "Requests rejected with 429")
            .expect("register gateway_requests_rate_limited_total");
    pub static ref KEY_EXTRACTION_FAILURES: Counter = register_counter!(
        "gateway_client_key_failures_total",
        "Requests rejected because the client address was unknown"
    )
    .expect("register gateway_client_key_failures_total");
    pub static ref VISITORS: Gauge =
        register_gauge!("gateway_visitors", "Visitors tracked after the last sweep")
            .expect("register gateway_visitors");
    pub static ref VISITORS_EVICTED: Counter =
        register_counter!("gateway_visitors_evicted_total", "Stale visitors removed by sweeps")
            .expect("register gateway_visitors_evicted_total");
    pub static ref VIEWS_RECORDED: Counter =
        register_counter!("gateway_views_total", "Views recorded")
            .expect("register gateway_views_total");
    pub static ref CLICKS_RECORDED: Counter =
        register_counter!("gateway_clicks_total", "Clicks recorded")
            .expect("register gateway_clicks_total");
    pub static ref SNAPSHOTS_UPLOADED: Counter =
        register_counter!("gateway_snapshots_uploaded_total", "Counter snapshots accepted by the store")
            .expect("register gateway_snapshots_uploaded_total");
    pub static ref UPLOAD_FAILURES: Counter =
        register_counter!("gateway_upload_failures_total", "Counter snapshot uploads that failed")
            .expect("register gateway_upload_failures_total");
    pub static ref SWEEPER_FAILURES: CounterVec = register_counter_vec!(
        opts!("gateway_sweeper_failures_total", "Failed sweeper runs"),
        &["sweeper"]
    )
    .expect("register gateway_sweeper_failures_total");
    pub static ref SWEEPERS_STOPPED: Gauge = register_gauge!(
        "gateway_sweepers_stopped",
        "Sweepers stopped after a failure"
    )
    .expect("register gateway_sweepers_stopped");
}

// Render everything in the default registry in the text exposition format
pub fn render() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
