//! Counter gateway
//!
//! An HTTP service that rate limits each client with a token bucket and counts
//! views and clicks per content category and minute. Counts are drained on a
//! fixed interval and handed to a [`store::CounterStore`]; idle clients are
//! swept out of the limiter on another interval.

pub mod config;
pub mod counters;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod rate_limit;
pub mod service;
pub mod state;
pub mod store;
pub mod sweeper;

pub use config::{Args, FailurePolicy, GatewayConfig};
pub use counters::{CounterAggregator, CounterEntry, CounterSnapshot, MetricKey};
pub use error::{GatewayError, Result};
pub use rate_limit::{TokenBucket, VisitorRegistry};
pub use service::Gateway;
pub use store::{CounterStore, LogStore, MemoryStore, StoreError};
