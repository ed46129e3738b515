//! Error types for sliding-throttle.

use thiserror::Error;

use crate::mesh::ClusterError;
use crate::store::StoreError;

/// Main error type for throttling operations.
#[derive(Error, Debug)]
pub enum ThrottleError {
    /// Policy or configuration problems, raised before any request is checked
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// Malformed input to a check (empty key, non-finite timestamp)
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The history store could not be read or written
    #[error("Storage backend unavailable: {0}")]
    BackendUnavailable(#[from] StoreError),

    /// Every compare-and-set attempt lost to a concurrent writer
    #[error("Gave up on key '{key}' after {attempts} conflicting writes")]
    Contention { key: String, attempts: usize },

    /// Cluster membership errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for throttling operations.
pub type Result<T> = std::result::Result<T, ThrottleError>;
