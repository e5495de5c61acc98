//! View/click counters grouped by category and minute, drained periodically.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::error::GatewayError;
use crate::metrics::{CLICKS_RECORDED, SNAPSHOTS_UPLOADED, UPLOAD_FAILURES, VIEWS_RECORDED};
use crate::store::CounterStore;
use crate::sweeper::SweepTask;

/// Content category plus a minute-granularity window label.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MetricKey {
    category: String,
    window: String,
}

impl MetricKey {
    pub fn new(category: impl Into<String>, window: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            window: window.into(),
        }
    }

    /// Key for the minute containing `at`, e.g. `sports:2024-3-7 12:05`.
    pub fn for_minute<Tz: TimeZone>(category: impl Into<String>, at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self::new(category, at.format("%Y-%-m-%-d %H:%M").to_string())
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn window(&self) -> &str {
        &self.window
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.category, self.window)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("metric key must look like <category>:<window>, got {0:?}")]
pub struct ParseMetricKeyError(String);

impl FromStr for MetricKey {
    type Err = ParseMetricKeyError;

    // splits on the first ':' only; windows contain colons
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((category, window)) if !category.is_empty() && !window.is_empty() => {
                Ok(Self::new(category, window))
            }
            _ => Err(ParseMetricKeyError(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterEntry {
    pub views: u64,
    pub clicks: u64,
}

impl CounterEntry {
    fn absorb(&mut self, other: CounterEntry) {
        self.views += other.views;
        self.clicks += other.clicks;
    }
}

/// One row of a snapshot, as handed to stores and the stats endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CounterRecord {
    pub category: String,
    pub window: String,
    pub views: u64,
    pub clicks: u64,
}

/// Counts captured by a drain (or a peek).
#[derive(Debug, Clone, PartialEq)]
pub struct CounterSnapshot {
    entries: HashMap<MetricKey, CounterEntry>,
    taken_at: DateTime<Utc>,
}

impl CounterSnapshot {
    fn new(entries: HashMap<MetricKey, CounterEntry>) -> Self {
        Self {
            entries,
            taken_at: Utc::now(),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }

    pub fn get(&self, key: &MetricKey) -> Option<CounterEntry> {
        self.entries.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&MetricKey, &CounterEntry)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn taken_at(&self) -> DateTime<Utc> {
        self.taken_at
    }

    pub fn merge(&mut self, other: CounterSnapshot) {
        for (key, entry) in other.entries {
            self.entries.entry(key).or_default().absorb(entry);
        }
    }

    /// Rows sorted by category then window.
    pub fn records(&self) -> Vec<CounterRecord> {
        let mut keys: Vec<&MetricKey> = self.entries.keys().collect();
        keys.sort();
        keys.into_iter()
            .map(|key| {
                let entry = self.entries[key];
                CounterRecord {
                    category: key.category.clone(),
                    window: key.window.clone(),
                    views: entry.views,
                    clicks: entry.clicks,
                }
            })
            .collect()
    }
}

/// Live counters.
///
/// A single mutex guards the whole map: increments are O(1) and `drain` has to
/// swap the map out in one step.
#[derive(Default)]
pub struct CounterAggregator {
    counters: Mutex<HashMap<MetricKey, CounterEntry>>,
}

impl CounterAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_view(&self, key: &MetricKey) {
        self.update(key, |entry| entry.views += 1);
        VIEWS_RECORDED.inc();
    }

    /// Creates the entry if no view was recorded for `key` yet.
    pub fn record_click(&self, key: &MetricKey) {
        self.update(key, |entry| entry.clicks += 1);
        CLICKS_RECORDED.inc();
    }

    fn update(&self, key: &MetricKey, f: impl FnOnce(&mut CounterEntry)) {
        let mut counters = self.counters.lock();
        match counters.get_mut(key) {
            Some(entry) => f(entry),
            None => f(counters.entry(key.clone()).or_default()),
        }
    }

    pub fn drain(&self) -> CounterSnapshot {
        let entries = std::mem::take(&mut *self.counters.lock());
        CounterSnapshot::new(entries)
    }

    pub fn peek(&self) -> CounterSnapshot {
        let entries = self.counters.lock().clone();
        CounterSnapshot::new(entries)
    }

    pub fn len(&self) -> usize {
        self.counters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counters.lock().is_empty()
    }
}

/// Periodic drain of the aggregator into a [`CounterStore`].
///
/// Counts whose upload failed are kept and retried together with the next
/// drain. Once more than `max_pending_entries` keys would be pending, the
/// oldest pending counts are dropped in favour of the newest.
pub struct CounterFlush {
    counters: Arc<CounterAggregator>,
    store: Arc<dyn CounterStore>,
    pending: Option<CounterSnapshot>,
    max_pending_entries: usize,
}

impl CounterFlush {
    pub fn new(
        counters: Arc<CounterAggregator>,
        store: Arc<dyn CounterStore>,
        max_pending_entries: usize,
    ) -> Self {
        Self {
            counters,
            store,
            pending: None,
            max_pending_entries,
        }
    }

    /// Entries waiting for a retry after a failed upload.
    pub fn pending_entries(&self) -> usize {
        self.pending.as_ref().map_or(0, CounterSnapshot::len)
    }

    // Keep `fresh` for the next attempt. If it no longer fits next to the
    // older pending counts, the older ones go.
    fn requeue(&mut self, fresh: CounterSnapshot) {
        let Some(mut pending) = self.pending.take() else {
            self.pending = (!fresh.is_empty()).then_some(fresh);
            return;
        };

        let new_keys = fresh.iter().filter(|(key, _)| pending.get(key).is_none()).count();
        if pending.len() + new_keys > self.max_pending_entries {
            error!(
                dropped = pending.len(),
                kept = fresh.len(),
                max = self.max_pending_entries,
                "Dropping oldest pending counters, too many entries pending"
            );
            self.pending = (!fresh.is_empty()).then_some(fresh);
            return;
        }
        pending.merge(fresh);
        self.pending = Some(pending);
    }
}

#[async_trait]
impl SweepTask for CounterFlush {
    fn name(&self) -> &'static str {
        "counter-flush"
    }

    async fn run(&mut self) -> Result<(), GatewayError> {
        let fresh = self.counters.drain();

        // pending stays separate from this tick's counts until an upload succeeds;
        // upload runs without the aggregator lock held
        let result = match &self.pending {
            Some(pending) => {
                let mut batch = pending.clone();
                batch.merge(fresh.clone());
                self.store.upload(&batch).await.map(|()| batch.len())
            }
            None if fresh.is_empty() => return Ok(()),
            None => self.store.upload(&fresh).await.map(|()| fresh.len()),
        };

        match result {
            Ok(entries) => {
                self.pending = None;
                SNAPSHOTS_UPLOADED.inc();
                debug!(entries, "Flushed counters");
                Ok(())
            }
            Err(e) => {
                UPLOAD_FAILURES.inc();
                warn!(
                    entries = fresh.len(),
                    pending = self.pending_entries(),
                    error = %e,
                    "Counter upload failed, requeueing"
                );
                self.requeue(fresh);
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn key(s: &str) -> MetricKey {
        s.parse().unwrap()
    }

    #[test]
    fn test_metric_key_parse_and_display() {
        let k = key("sports:12:00");
        assert_eq!(k.category(), "sports");
        assert_eq!(k.window(), "12:00");
        assert_eq!(k.to_string(), "sports:12:00");

        assert!("nocolon".parse::<MetricKey>().is_err());
        assert!(":12:00".parse::<MetricKey>().is_err());
    }

    #[test]
    fn test_metric_key_for_minute() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 7)
            .unwrap()
            .and_hms_opt(9, 5, 42)
            .unwrap()
            .and_utc();
        let k = MetricKey::for_minute("business", &at);
        assert_eq!(k.to_string(), "business:2024-3-7 09:05");
    }

    #[test]
    fn test_drain_scenario() {
        let counters = CounterAggregator::new();
        let sports = key("sports:12:00");
        let business = key("business:12:00");

        for _ in 0..3 {
            counters.record_view(&sports);
        }
        counters.record_click(&sports);
        counters.record_view(&business);

        let snapshot = counters.drain();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.get(&sports), Some(CounterEntry { views: 3, clicks: 1 }));
        assert_eq!(snapshot.get(&business), Some(CounterEntry { views: 1, clicks: 0 }));
        assert!(counters.is_empty());

        counters.record_view(&sports);
        let next = counters.drain();
        assert_eq!(next.get(&sports), Some(CounterEntry { views: 1, clicks: 0 }));
    }

    #[test]
    fn test_click_without_view_creates_entry() {
        let counters = CounterAggregator::new();
        let k = key("education:08:30");
        counters.record_click(&k);

        assert_eq!(counters.peek().get(&k), Some(CounterEntry { views: 0, clicks: 1 }));
    }

    #[test]
    fn test_peek_does_not_reset() {
        let counters = CounterAggregator::new();
        let k = key("sports:12:00");
        counters.record_view(&k);

        assert_eq!(counters.peek().len(), 1);
        assert_eq!(counters.len(), 1);
        assert_eq!(counters.drain().get(&k), Some(CounterEntry { views: 1, clicks: 0 }));
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let counters = Arc::new(CounterAggregator::new());
        let k = key("entertainment:18:45");

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let counters = counters.clone();
                let k = k.clone();
                std::thread::spawn(move || {
                    counters.record_view(&k);
                    counters.record_click(&k);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(counters.drain().get(&k), Some(CounterEntry { views: 64, clicks: 64 }));
    }

    #[test]
    fn test_snapshot_merge_and_records() {
        let a = CounterAggregator::new();
        a.record_view(&key("sports:12:00"));
        a.record_view(&key("business:12:00"));
        let mut first = a.drain();

        a.record_view(&key("sports:12:00"));
        a.record_click(&key("sports:12:00"));
        first.merge(a.drain());

        let records = first.records();
        assert_eq!(
            records,
            vec![
                CounterRecord {
                    category: "business".into(),
                    window: "12:00".into(),
                    views: 1,
                    clicks: 0,
                },
                CounterRecord {
                    category: "sports".into(),
                    window: "12:00".into(),
                    views: 2,
                    clicks: 1,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_flush_uploads_and_skips_empty() {
        let counters = Arc::new(CounterAggregator::new());
        let store = Arc::new(MemoryStore::new());
        let mut flush = CounterFlush::new(counters.clone(), store.clone(), 100);

        flush.run().await.unwrap();
        assert_eq!(store.upload_count(), 0);

        counters.record_view(&key("sports:12:00"));
        flush.run().await.unwrap();
        assert_eq!(store.upload_count(), 1);
        assert!(counters.is_empty());
    }

    #[tokio::test]
    async fn test_flush_requeues_failed_snapshot() {
        let counters = Arc::new(CounterAggregator::new());
        let store = Arc::new(MemoryStore::new());
        let mut flush = CounterFlush::new(counters.clone(), store.clone(), 100);
        let k = key("sports:12:00");

        store.set_failing(true);
        counters.record_view(&k);
        assert!(flush.run().await.is_err());
        assert_eq!(flush.pending_entries(), 1);

        store.set_failing(false);
        counters.record_view(&k);
        counters.record_click(&k);
        flush.run().await.unwrap();

        assert_eq!(flush.pending_entries(), 0);
        let totals = store.totals();
        assert_eq!(totals.get(&k), Some(CounterEntry { views: 2, clicks: 1 }));
    }

    #[tokio::test]
    async fn test_flush_keeps_newest_counts_when_pending_is_full() {
        let counters = Arc::new(CounterAggregator::new());
        let store = Arc::new(MemoryStore::new());
        let mut flush = CounterFlush::new(counters.clone(), store.clone(), 1);
        let sports = key("sports:12:00");
        let business = key("business:12:01");

        store.set_failing(true);
        counters.record_view(&sports);
        assert!(flush.run().await.is_err());
        assert_eq!(flush.pending_entries(), 1);

        counters.record_view(&business);
        assert!(flush.run().await.is_err());
        assert_eq!(flush.pending_entries(), 1);

        store.set_failing(false);
        flush.run().await.unwrap();
        assert_eq!(flush.pending_entries(), 0);

        let totals = store.totals();
        assert_eq!(totals.get(&business), Some(CounterEntry { views: 1, clicks: 0 }));
        assert_eq!(totals.get(&sports), None);
    }

    #[tokio::test]
    async fn test_flush_retries_pending_when_nothing_new() {
        let counters = Arc::new(CounterAggregator::new());
        let store = Arc::new(MemoryStore::new());
        let mut flush = CounterFlush::new(counters.clone(), store.clone(), 10);
        let k = key("education:09:00");

        store.set_failing(true);
        counters.record_click(&k);
        assert!(flush.run().await.is_err());

        store.set_failing(false);
        flush.run().await.unwrap();
        assert_eq!(store.upload_count(), 1);
        assert_eq!(store.totals().get(&k), Some(CounterEntry { views: 0, clicks: 1 }));
    }
}
