//! Per-client token buckets and the registry that owns them.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::error::GatewayError;
use crate::metrics::{VISITORS, VISITORS_EVICTED};
use crate::sweeper::SweepTask;

/// A continuously refilling permit pool.
///
/// Tokens are tracked as a float so fractional refill between calls is not lost.
/// `0 <= tokens <= capacity` holds after every call.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: u32,
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity as f64,
            last_refill: now,
        }
    }

    pub fn try_consume(&mut self) -> bool {
        self.try_consume_at(Instant::now())
    }

    /// Refill for the time elapsed since the last call, then take one token if available.
    ///
    /// Refill is applied on rejected calls too.
    pub fn try_consume_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity as f64);
        self.last_refill = self.last_refill.max(now);

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

// Visitor entry - one bucket per client key
struct Visitor {
    bucket: TokenBucket,
    last_seen: Instant,
}

/// Maps client keys to their buckets.
///
/// Lookup-or-create-then-consume happens under the DashMap shard lock for the
/// key, so two concurrent first requests from one client never create two
/// buckets.
pub struct VisitorRegistry {
    visitors: DashMap<String, Visitor>,
    capacity: u32,
    refill_rate: f64,
}

impl VisitorRegistry {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            visitors: DashMap::new(),
            capacity,
            refill_rate,
        }
    }

    pub fn check_and_admit(&self, key: &str) -> bool {
        self.check_and_admit_at(key, Instant::now())
    }

    pub fn check_and_admit_at(&self, key: &str, now: Instant) -> bool {
        let mut visitor = self
            .visitors
            .entry(key.to_string())
            .or_insert_with(|| Visitor {
                bucket: TokenBucket::new_at(self.capacity, self.refill_rate, now),
                last_seen: now,
            });

        visitor.last_seen = visitor.last_seen.max(now);
        visitor.bucket.try_consume_at(now)
    }

    /// Remove every visitor not seen for longer than `stale_after`.
    ///
    /// Shards are locked one at a time, so admission checks on other shards
    /// proceed during the pass.
    pub fn sweep(&self, stale_after: Duration) -> usize {
        self.sweep_at(stale_after, Instant::now())
    }

    pub fn sweep_at(&self, stale_after: Duration, now: Instant) -> usize {
        let mut removed = 0;
        self.visitors.retain(|_, visitor| {
            let keep = now.saturating_duration_since(visitor.last_seen) <= stale_after;
            if !keep {
                removed += 1;
            }
            keep
        });
        removed
    }

    pub fn contains(&self, key: &str) -> bool {
        self.visitors.contains_key(key)
    }

    /// Tokens currently left for `key`, as of its last check.
    pub fn tokens(&self, key: &str) -> Option<f64> {
        self.visitors.get(key).map(|v| v.bucket.tokens())
    }

    pub fn len(&self) -> usize {
        self.visitors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.visitors.is_empty()
    }
}

pub struct RegistrySweep {
    registry: Arc<VisitorRegistry>,
    stale_after: Duration,
}

impl RegistrySweep {
    pub fn new(registry: Arc<VisitorRegistry>, stale_after: Duration) -> Self {
        Self {
            registry,
            stale_after,
        }
    }
}

#[async_trait]
impl SweepTask for RegistrySweep {
    fn name(&self) -> &'static str {
        "visitor-sweep"
    }

    async fn run(&mut self) -> Result<(), GatewayError> {
        let removed = self.registry.sweep(self.stale_after);
        let remaining = self.registry.len();

        VISITORS_EVICTED.inc_by(removed as f64);
        VISITORS.set(remaining as f64);
        if removed > 0 {
            debug!(removed, remaining, "Evicted stale visitors");
        }
        Ok(())
    }
}
