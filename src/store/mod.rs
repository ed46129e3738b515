//! Storage backends for per-key request histories.
//!
//! The limiter never owns its state directly: it reads and conditionally
//! writes records through [`HistoryStore`], so an in-process map and a
//! cluster-replicated store are interchangeable.

mod gossip;
mod memory;

pub use gossip::GossipStore;
pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::ratelimit::HistoryRecord;

/// Errors raised by a history store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unreachable: {0}")]
    Unavailable(String),
    #[error("stored record for '{key}' is unreadable: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Key-value storage for history records, with expiry hints.
///
/// `compare_and_set` is what makes a limiter check atomic. Implementations
/// must apply it as one step per key, and must not serialize unrelated keys
/// behind a single lock.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Fetch the record stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>, StoreError>;

    /// Unconditionally store `record`; the backend may drop it after `ttl`.
    async fn set(&self, key: &str, record: HistoryRecord, ttl: Duration) -> Result<(), StoreError>;

    /// Store `record` only if the current value still equals `expected`
    /// (`None` meaning absent). Returns `false` when another writer got there first.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&HistoryRecord>,
        record: HistoryRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}
