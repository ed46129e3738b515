//! Peer Mesh networking module using Chitchat.
//!
//! This module implements the peer-to-peer mesh used to share request
//! histories between nodes. It uses the chitchat library for gossip-based
//! cluster membership and state dissemination.

mod cluster;

pub use cluster::{Cluster, ClusterConfig, ClusterError, HistoryKey};
