//! Destinations for drained counter snapshots.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tracing::info;

use crate::counters::CounterSnapshot;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("upload rejected: {0}")]
    Rejected(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Receives one snapshot per flush interval.
///
/// Implementations should not assume the snapshot is non-empty or that the
/// same keys never show up twice; a requeued snapshot is merged with newer
/// counts before it is retried.
#[async_trait]
pub trait CounterStore: Send + Sync {
    async fn upload(&self, snapshot: &CounterSnapshot) -> Result<(), StoreError>;
}

/// Writes every record to the log. Stands in for a real backing store.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogStore;

#[async_trait]
impl CounterStore for LogStore {
    async fn upload(&self, snapshot: &CounterSnapshot) -> Result<(), StoreError> {
        for record in snapshot.records() {
            info!(
                category = %record.category,
                window = %record.window,
                views = record.views,
                clicks = record.clicks,
                "counter"
            );
        }
        info!(
            entries = snapshot.len(),
            taken_at = %snapshot.taken_at().to_rfc3339(),
            "Uploaded counter snapshot"
        );
        Ok(())
    }
}

/// Keeps uploaded snapshots in memory. Can be switched to fail every upload.
#[derive(Debug, Default)]
pub struct MemoryStore {
    uploads: Mutex<Vec<CounterSnapshot>>,
    failing: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.lock().len()
    }

    pub fn uploads(&self) -> Vec<CounterSnapshot> {
        self.uploads.lock().clone()
    }

    /// All successfully uploaded counts folded into one snapshot.
    pub fn totals(&self) -> CounterSnapshot {
        let uploads = self.uploads.lock();
        let mut iter = uploads.iter().cloned();
        let Some(mut totals) = iter.next() else {
            return CounterSnapshot::empty();
        };
        for snapshot in iter {
            totals.merge(snapshot);
        }
        totals
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn upload(&self, snapshot: &CounterSnapshot) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store set to fail".into()));
        }
        self.uploads.lock().push(snapshot.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::{CounterAggregator, MetricKey};

    #[tokio::test]
    async fn test_log_store_accepts_snapshot() {
        let counters = CounterAggregator::new();
        counters.record_view(&MetricKey::new("sports", "12:00"));
        assert!(LogStore.upload(&counters.drain()).await.is_ok());
    }

    #[tokio::test]
    async fn test_memory_store_records_and_fails_on_demand() {
        let store = MemoryStore::new();
        let counters = CounterAggregator::new();
        let k = MetricKey::new("sports", "12:00");

        counters.record_view(&k);
        store.upload(&counters.drain()).await.unwrap();

        store.set_failing(true);
        counters.record_view(&k);
        let err = store.upload(&counters.peek()).await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        assert_eq!(store.upload_count(), 1);
        assert_eq!(store.totals().get(&k).map(|e| e.views), Some(1));
    }

    #[test]
    fn test_totals_of_empty_store() {
        assert!(MemoryStore::new().totals().is_empty());
    }
}
