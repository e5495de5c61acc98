use clap::{Parser, ValueEnum};
use std::time::Duration;

use crate::error::{GatewayError, Result};

// What a background sweeper does when its task reports an error
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// Log the failure and keep ticking
    #[default]
    Continue,
    /// Stop the sweeper for good; health turns unhealthy
    Stop,
}

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "counter-gateway")]
#[command(about = "Rate limited gateway that counts views and clicks per category")]
pub struct Args {
    /// Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    /// Token bucket capacity (burst size) per client
    #[arg(long, default_value_t = 5)]
    pub bucket_capacity: u32,

    /// Tokens refilled per second per client
    #[arg(long, default_value_t = 1.0)]
    pub refill_rate: f64,

    /// Visitor sweep interval in seconds
    #[arg(long, default_value_t = 5)]
    pub sweep_interval: u64,

    /// Evict visitors not seen for this many seconds
    #[arg(long, default_value_t = 300)]
    pub stale_after: u64,

    /// Counter flush interval in seconds
    #[arg(long, default_value_t = 5)]
    pub flush_interval: u64,

    /// What to do when a sweep or flush fails
    #[arg(long, value_enum, default_value_t = FailurePolicy::Continue)]
    pub failure_policy: FailurePolicy,

    /// Probability that a view also records a click
    #[arg(long, default_value_t = 0.5)]
    pub click_probability: f64,

    /// Max counter entries kept for retry after failed uploads
    #[arg(long, default_value_t = 10_000)]
    pub max_pending_entries: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    pub port: u16,
    pub bucket_capacity: u32,
    pub refill_rate: f64,
    pub sweep_interval: Duration,
    pub stale_after: Duration,
    pub flush_interval: Duration,
    pub failure_policy: FailurePolicy,
    pub click_probability: f64,
    pub max_pending_entries: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            bucket_capacity: 5,
            refill_rate: 1.0,
            sweep_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(300),
            flush_interval: Duration::from_secs(5),
            failure_policy: FailurePolicy::Continue,
            click_probability: 0.5,
            max_pending_entries: 10_000,
        }
    }
}

impl GatewayConfig {
    /// Reject values the limiter and sweepers cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_capacity == 0 {
            return Err(GatewayError::Config("bucket capacity must be at least 1".into()));
        }
        if !self.refill_rate.is_finite() || self.refill_rate <= 0.0 {
            return Err(GatewayError::Config(format!(
                "refill rate must be a positive number, got {}",
                self.refill_rate
            )));
        }
        if self.sweep_interval.is_zero() || self.flush_interval.is_zero() {
            return Err(GatewayError::Config("intervals must be non-zero".into()));
        }
        if !(0.0..=1.0).contains(&self.click_probability) {
            return Err(GatewayError::Config(format!(
                "click probability must be within [0, 1], got {}",
                self.click_probability
            )));
        }
        Ok(())
    }
}

impl TryFrom<Args> for GatewayConfig {
    type Error = GatewayError;

    fn try_from(args: Args) -> Result<Self> {
        let config = GatewayConfig {
            port: args.port,
            bucket_capacity: args.bucket_capacity,
            refill_rate: args.refill_rate,
            sweep_interval: Duration::from_secs(args.sweep_interval),
            stale_after: Duration::from_secs(args.stale_after),
            flush_interval: Duration::from_secs(args.flush_interval),
            failure_policy: args.failure_policy,
            click_probability: args.click_probability,
            max_pending_entries: args.max_pending_entries,
        };
        config.validate()?;
        Ok(config)
    }
}
