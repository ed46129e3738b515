//! Configuration management for sliding-throttle.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, ThrottleError};
use crate::mesh::ClusterConfig;
use crate::ratelimit::{RatePolicy, ScopeRates};

/// Prefix for environment overrides, e.g. `THROTTLE__STORE__BACKEND=gossip`.
pub const ENV_PREFIX: &str = "THROTTLE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Rate per scope; a null rate leaves the scope unlimited
    #[serde(default)]
    pub rates: ScopeRates,

    /// History store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Cluster configuration, used by the gossip backend
    #[serde(default)]
    pub cluster: ClusterSettings,
}

/// Which history store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process map
    #[default]
    Memory,
    /// Replicated across the cluster mesh
    Gossip,
}

/// History store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// How often expired histories are swept, in seconds
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    /// Compare-and-set attempts per check before reporting contention
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            sweep_interval_secs: default_sweep_interval(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_retries() -> usize {
    crate::ratelimit::DEFAULT_MAX_RETRIES
}

/// Cluster membership configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Node identifier; a random UUID when unset
    #[serde(default)]
    pub node_id: Option<String>,

    /// Gossip listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Address advertised to peers; defaults to the listen address
    #[serde(default)]
    pub advertise_addr: Option<SocketAddr>,

    /// Seed nodes to join through
    #[serde(default)]
    pub seed_nodes: Vec<String>,

    #[serde(default = "default_cluster_id")]
    pub cluster_id: String,

    #[serde(default = "default_gossip_interval")]
    pub gossip_interval_ms: u64,

    #[serde(default = "default_dead_node_grace_period")]
    pub dead_node_grace_period_secs: u64,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            node_id: None,
            listen_addr: default_listen_addr(),
            advertise_addr: None,
            seed_nodes: Vec::new(),
            cluster_id: default_cluster_id(),
            gossip_interval_ms: default_gossip_interval(),
            dead_node_grace_period_secs: default_dead_node_grace_period(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 7946))
}

fn default_cluster_id() -> String {
    "sliding-throttle".to_string()
}

fn default_gossip_interval() -> u64 {
    100
}

fn default_dead_node_grace_period() -> u64 {
    3600
}

impl ClusterSettings {
    /// Build the mesh configuration for this node.
    pub fn to_cluster_config(&self) -> ClusterConfig {
        let defaults = ClusterConfig::default();
        ClusterConfig {
            node_id: self.node_id.clone().unwrap_or(defaults.node_id),
            listen_addr: self.listen_addr,
            advertise_addr: self.advertise_addr.unwrap_or(self.listen_addr),
            seed_nodes: self.seed_nodes.clone(),
            cluster_id: self.cluster_id.clone(),
            gossip_interval: Duration::from_millis(self.gossip_interval_ms),
            dead_node_grace_period: Duration::from_secs(self.dead_node_grace_period_secs),
        }
    }
}

impl ThrottleConfig {
    /// Load configuration from a file, with `THROTTLE__*` environment overrides.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading throttle configuration");

        let settings = config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .map_err(|e| ThrottleError::InvalidConfiguration(e.to_string()))?;

        let config: ThrottleConfig = settings
            .try_deserialize()
            .map_err(|e| ThrottleError::InvalidConfiguration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ThrottleConfig = serde_yaml::from_str(yaml).map_err(|e| {
            ThrottleError::InvalidConfiguration(format!("Failed to parse throttle config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject rates and store settings that could never be used.
    pub fn validate(&self) -> Result<()> {
        for (scope, rate) in &self.rates {
            if let Some(rate) = rate {
                rate.parse::<RatePolicy>().map_err(|e| {
                    ThrottleError::InvalidConfiguration(format!("scope '{}': {}", scope, e))
                })?;
            }
        }
        if self.store.sweep_interval_secs == 0 {
            return Err(ThrottleError::InvalidConfiguration(
                "store.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        if self.store.max_retries == 0 {
            return Err(ThrottleError::InvalidConfiguration(
                "store.max_retries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
