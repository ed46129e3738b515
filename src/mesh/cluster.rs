//! Cluster management using Chitchat.
//!
//! This module wraps the chitchat library to provide cluster membership,
//! failure detection, and gossip of request histories between nodes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::ratelimit::HistoryRecord;

const HISTORY_PREFIX: &str = "history|";

/// Errors that can occur in cluster operations.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Failed to start cluster: {0}")]
    StartError(String),
    #[error("Failed to shut down cluster: {0}")]
    ShutdownError(String),
    #[error("Node '{node_id}' published an unreadable value for '{key}': {reason}")]
    CorruptState {
        node_id: String,
        key: String,
        reason: String,
    },
}

/// Configuration for the cluster.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Unique node identifier.
    pub node_id: String,
    /// The address to listen on for gossip.
    pub listen_addr: SocketAddr,
    /// The address to advertise to other nodes.
    pub advertise_addr: SocketAddr,
    /// Seed nodes to bootstrap cluster membership.
    pub seed_nodes: Vec<String>,
    /// Cluster identifier (nodes must have matching cluster IDs).
    pub cluster_id: String,
    /// How often to gossip with peers.
    pub gossip_interval: Duration,
    /// Grace period before considering a dead node's state deletable.
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        let default_addr = SocketAddr::from(([0, 0, 0, 0], 7946));
        Self {
            node_id: uuid::Uuid::new_v4().to_string(),
            listen_addr: default_addr,
            advertise_addr: default_addr,
            seed_nodes: Vec::new(),
            cluster_id: "sliding-throttle".to_string(),
            gossip_interval: Duration::from_millis(100),
            dead_node_grace_period: Duration::from_secs(3600),
        }
    }
}

/// Key under which a node publishes its share of an identity's history.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HistoryKey {
    /// The identity key as given to the limiter.
    pub identity: String,
}

impl HistoryKey {
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
        }
    }

    /// Format: "history|{identity}"
    pub fn to_chitchat_key(&self) -> String {
        format!("{}{}", HISTORY_PREFIX, self.identity)
    }
}

/// Expiry bookkeeping for the keys this node currently publishes.
///
/// Times are caller seconds. Only touched while the chitchat lock is held.
#[derive(Debug)]
struct Ledger {
    /// Chitchat key -> time after which none of our entries under it count.
    expiries: HashMap<String, f64>,
    /// Latest admission timestamp this node has published.
    high_water: f64,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            expiries: HashMap::new(),
            high_water: f64::NEG_INFINITY,
        }
    }
}

/// The cluster handle for distributed state management.
///
/// Every node publishes only the admissions it recorded itself; the history
/// of an identity is the union of all live nodes' contributions. A node
/// withdraws its key once its share is empty or has aged out of the window.
pub struct Cluster {
    /// Our node ID.
    node_id: String,
    /// Chitchat handle.
    handle: ChitchatHandle,
    config: ClusterConfig,
    ledger: parking_lot::Mutex<Ledger>,
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("node_id", &self.node_id)
            .field("config", &self.config)
            .finish()
    }
}

impl Cluster {
    /// Create and start a new cluster node.
    pub async fn start(config: ClusterConfig) -> Result<Self, ClusterError> {
        info!(
            node_id = %config.node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %config.advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting cluster node"
        );

        let chitchat_id = ChitchatId {
            node_id: config.node_id.clone(),
            generation_id: 0,
            gossip_advertise_addr: config.advertise_addr,
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id,
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: config.gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let transport = UdpTransport;
        let handle = spawn_chitchat(chitchat_config, Vec::new(), &transport)
            .await
            .map_err(|e| ClusterError::StartError(e.to_string()))?;

        info!("Cluster node started successfully");

        Ok(Self {
            node_id: config.node_id.clone(),
            handle,
            config,
            ledger: parking_lot::Mutex::new(Ledger::default()),
        })
    }

    /// Get our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// Get the configuration this node was started with.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// Get the chitchat handle for direct access.
    pub fn chitchat(&self) -> Arc<Mutex<Chitchat>> {
        self.handle.chitchat()
    }

    /// Read the merged history for an identity across all live nodes.
    pub async fn read_history(&self, key: &HistoryKey) -> Result<Option<HistoryRecord>, ClusterError> {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let peers = self.peer_entries(&chitchat, &chitchat_key)?;
        let own = self.own_entries(&mut chitchat, &chitchat_key)?;
        Ok(merge(own, peers))
    }

    /// Replace this node's contribution so that the merged history equals `record`.
    ///
    /// `window` is how long an entry counts; entries already older than that
    /// are not published.
    pub async fn write_history(
        &self,
        key: &HistoryKey,
        record: &HistoryRecord,
        window: Duration,
    ) -> Result<(), ClusterError> {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let peers = self.peer_entries(&chitchat, &chitchat_key)?;
        self.publish(&mut chitchat, &chitchat_key, record, &peers, window);
        Ok(())
    }

    /// Write `record` only if the merged history still equals `expected`.
    ///
    /// The chitchat lock is held across the comparison and the write, which
    /// makes this atomic with respect to other writers on this node. Writers
    /// on other nodes are only seen once their state has been gossiped.
    pub async fn compare_and_set_history(
        &self,
        key: &HistoryKey,
        expected: Option<&HistoryRecord>,
        record: &HistoryRecord,
        window: Duration,
    ) -> Result<bool, ClusterError> {
        let chitchat_key = key.to_chitchat_key();
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;

        let peers = self.peer_entries(&chitchat, &chitchat_key)?;
        let own = self.own_entries(&mut chitchat, &chitchat_key)?;
        let current = merge(own, peers.clone());

        if current.as_ref() != expected {
            debug!(key = %chitchat_key, "History changed since it was read");
            return Ok(false);
        }

        self.publish(&mut chitchat, &chitchat_key, record, &peers, window);
        Ok(true)
    }

    /// Withdraw every key whose entries have all aged out, measured against
    /// the latest admission this node published. Returns how many were removed.
    pub async fn purge_expired(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        let mut ledger = self.ledger.lock();

        let now = ledger.high_water;
        let expired: Vec<String> = ledger
            .expiries
            .iter()
            .filter(|(_, expires_at)| **expires_at <= now)
            .map(|(key, _)| key.clone())
            .collect();

        let node_state = chitchat.self_node_state();
        for key in &expired {
            ledger.expiries.remove(key);
            if node_state.contains_key(key) {
                node_state.delete(key);
            }
        }
        expired.len()
    }

    /// Number of keys this node currently publishes.
    pub async fn published_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat
            .self_node_state()
            .iter_prefix(HISTORY_PREFIX)
            .count()
    }

    /// Periodically withdraw expired keys until the cluster is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let cluster: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(cluster) = cluster.upgrade() else {
                    break;
                };
                let purged = cluster.purge_expired().await;
                if purged > 0 {
                    debug!(purged, "Withdrew expired histories");
                }
            }
        })
    }

    /// Entries published by every live node other than ourselves.
    fn peer_entries(&self, chitchat: &Chitchat, key: &str) -> Result<Vec<f64>, ClusterError> {
        let mut entries = Vec::new();

        for node_id in chitchat.live_nodes() {
            if node_id.node_id == self.node_id {
                continue;
            }
            if let Some(node_state) = chitchat.node_state(node_id) {
                if let Some(value) = node_state.get(key) {
                    entries.extend(decode(&node_id.node_id, key, value)?);
                }
            }
        }

        Ok(entries)
    }

    /// Entries this node has published.
    fn own_entries(&self, chitchat: &mut Chitchat, key: &str) -> Result<Vec<f64>, ClusterError> {
        match chitchat.self_node_state().get(key) {
            Some(value) => decode(&self.node_id, key, value),
            None => Ok(Vec::new()),
        }
    }

    /// Publish the part of `record` that peers do not already account for.
    ///
    /// Entries a full window older than the record's newest admission are
    /// left out. An empty share withdraws the key instead of publishing `[]`.
    fn publish(
        &self,
        chitchat: &mut Chitchat,
        key: &str,
        record: &HistoryRecord,
        peers: &[f64],
        window: Duration,
    ) {
        let horizon = record
            .newest()
            .map_or(f64::NEG_INFINITY, |newest| newest - window.as_secs_f64());
        let mut unclaimed = peers.to_vec();
        let own: Vec<f64> = record
            .iter()
            .filter(|ts| match unclaimed.iter().position(|p| p == ts) {
                Some(idx) => {
                    unclaimed.swap_remove(idx);
                    false
                }
                None => true,
            })
            .filter(|&ts| ts > horizon)
            .collect();

        let mut ledger = self.ledger.lock();
        if let Some(newest) = record.newest() {
            ledger.high_water = ledger.high_water.max(newest);
        }

        let node_state = chitchat.self_node_state();
        let Some(latest) = own.iter().copied().reduce(f64::max) else {
            ledger.expiries.remove(key);
            if node_state.contains_key(key) {
                node_state.delete(key);
                debug!(key = %key, peer_entries = peers.len(), "Withdrew local history");
            }
            return;
        };

        // Vec<f64> always serializes
        let value = serde_json::to_string(&own).unwrap_or_else(|_| "[]".to_string());
        node_state.set(key, value);
        ledger
            .expiries
            .insert(key.to_string(), latest + window.as_secs_f64());

        debug!(
            key = %key,
            local_entries = own.len(),
            peer_entries = peers.len(),
            "Published local history"
        );
    }

    /// Get the number of live nodes in the cluster.
    pub async fn live_node_count(&self) -> usize {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().count()
    }

    /// Get the IDs of all live nodes.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.handle.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat
            .live_nodes()
            .map(|id| id.node_id.clone())
            .collect()
    }

    /// Shutdown the cluster node gracefully.
    pub async fn shutdown(self) -> Result<(), ClusterError> {
        info!(node_id = %self.node_id, "Shutting down cluster node");
        self.handle
            .shutdown()
            .await
            .map_err(|e| ClusterError::ShutdownError(format!("{:?}", e)))?;
        Ok(())
    }
}

fn decode(node_id: &str, key: &str, value: &str) -> Result<Vec<f64>, ClusterError> {
    if value.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(value).map_err(|e| ClusterError::CorruptState {
        node_id: node_id.to_string(),
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Union of all contributions, most recent first. `None` when nobody has any.
fn merge(mut own: Vec<f64>, peers: Vec<f64>) -> Option<HistoryRecord> {
    own.extend(peers);
    if own.is_empty() {
        return None;
    }
    own.sort_by(|a, b| b.total_cmp(a));
    Some(own.into_iter().collect())
}
