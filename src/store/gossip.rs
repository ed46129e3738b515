//! History store replicated across the cluster mesh.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::trace;

use super::{HistoryStore, StoreError};
use crate::mesh::{Cluster, ClusterError, HistoryKey};
use crate::ratelimit::HistoryRecord;

/// A history store backed by Chitchat cluster state.
///
/// Reads return the union of every live node's admissions, so a key's quota
/// is shared by the whole cluster. Writes are atomic per node only: two nodes
/// admitting at the same moment can both succeed until gossip catches up.
#[derive(Debug, Clone)]
pub struct GossipStore {
    cluster: Arc<Cluster>,
}

impl GossipStore {
    pub fn new(cluster: Arc<Cluster>) -> Self {
        Self { cluster }
    }

    /// Get the cluster.
    pub fn cluster(&self) -> &Arc<Cluster> {
        &self.cluster
    }
}

impl From<ClusterError> for StoreError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::CorruptState { key, reason, .. } => StoreError::Corrupt { key, reason },
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[async_trait]
impl HistoryStore for GossipStore {
    async fn get(&self, key: &str) -> Result<Option<HistoryRecord>, StoreError> {
        Ok(self.cluster.read_history(&HistoryKey::new(key)).await?)
    }

    async fn set(&self, key: &str, record: HistoryRecord, ttl: Duration) -> Result<(), StoreError> {
        trace!(key, entries = record.len(), "Writing gossiped history");
        Ok(self.cluster.write_history(&HistoryKey::new(key), &record, ttl).await?)
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&HistoryRecord>,
        record: HistoryRecord,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        Ok(self
            .cluster
            .compare_and_set_history(&HistoryKey::new(key), expected, &record, ttl)
            .await?)
    }
}
