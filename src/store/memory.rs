//! In-process history store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{HistoryStore, StoreError};
use crate::ratelimit::HistoryRecord;

#[derive(Debug, Clone)]
struct StoredRecord {
    record: HistoryRecord,
    /// Caller-time second after which no entry in the record can count.
    expires_at: f64,
}

impl StoredRecord {
    fn new(record: HistoryRecord, ttl: Duration) -> Self {
        let expires_at = record
            .newest()
            .map_or(f64::NEG_INFINITY, |newest| newest + ttl.as_secs_f64());
        Self { record, expires_at }
    }
}

/// A concurrent in-memory store.
///
/// Entries live in a sharded `DashMap`; a compare-and-set holds only the
/// shard lock of its own key. Reads never hide a record: expiry is measured
/// in the callers' own time base, against the latest timestamp written to
/// the store, and is applied only by [`MemoryStore::purge_expired`] and the
/// background sweeper. All callers of one store must share a time base.
#[derive(Debug)]
pub struct MemoryStore {
    records: DashMap<String, StoredRecord>,
    high_water: Mutex<f64>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            records: DashMap::new(),
            high_water: Mutex::new(f64::NEG_INFINITY),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Latest caller timestamp written to the store.
    pub fn high_water(&self) -> Option<f64> {
        let high_water = *self.high_water.lock();
        high_water.is_finite().then_some(high_water)
    }

    /// Remove every entry whose expiry lies at or before the latest written
    /// timestamp. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = *self.high_water.lock();
        let before = self.records.len();
        self.records.retain(|_, stored| stored.expires_at > now);
        before.saturating_sub(self.records.len())
    }

    /// Periodically purge expired entries until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    debug!(purged, remaining = store.len(), "Purged expired histories");
                }
            }
        })
    }

    fn advance_high_water(&self, newest: Option<f64>) {
        if let Some(newest) = newest {
            let mut high_water = self.high_water.lock();
            if newest > *high_water {
                *high_water = newest;
            }
        }
    }
}

#[async_trait]
impl HistoryStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(self.records.get(key).map(|stored| stored.record.clone()))
    }

    async fn set(&self, key: &str, record: HistoryRecord, ttl: Duration) -> Result<(), StoreError> {
        self.advance_high_water(record.newest());
        self.records
            .insert(key.to_string(), StoredRecord::new(record, ttl));
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&HistoryRecord>,
        record: HistoryRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        let written = record.newest();
        match self.records.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if Some(&occupied.get().record) != expected {
                    trace!(key, "Compare-and-set lost to a concurrent writer");
                    return Ok(false);
                }
                occupied.insert(StoredRecord::new(record, ttl));
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    trace!(key, "Compare-and-set found the record gone");
                    return Ok(false);
                }
                vacant.insert(StoredRecord::new(record, ttl));
            }
        }

        // Shard lock is released before the high-water lock is taken
        self.advance_high_water(written);
        Ok(true)
    }
}
