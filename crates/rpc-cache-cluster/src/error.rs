//! Cluster error types.

use rpc_cache_protocol::CacheError;
use thiserror::Error;

/// Cluster result type
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors from membership, bootstrap and gossip transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClusterError {
    #[error("node name '{name}' is already held by a live member at {holder}")]
    NameCollision { name: String, holder: String },

    #[error("join rejected by {addr}: {reason}")]
    JoinRejected { addr: String, reason: String },

    #[error("could not join cluster via {addrs:?} after {attempts} attempts")]
    JoinFailed { addrs: Vec<String>, attempts: u32 },

    #[error("peer {addr} unreachable: {reason}")]
    Unreachable { addr: String, reason: String },

    #[error("invalid bootstrap configuration: {0}")]
    InvalidBootstrap(String),

    #[error("timed out waiting for {expected} alive nodes ({alive} alive)")]
    FormationTimeout { expected: usize, alive: usize },

    #[error("membership task stopped")]
    Stopped,
}

impl ClusterError {
    pub fn unreachable(addr: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unreachable {
            addr: addr.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. } | Self::FormationTimeout { .. })
    }
}

impl From<ClusterError> for CacheError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::Unreachable { ref addr, .. } => CacheError::cluster_unavailable(&[addr.clone()]),
            ClusterError::InvalidBootstrap(msg) => CacheError::config(msg),
            other => CacheError::new(rpc_cache_protocol::ErrorCode::ClusterUnavailable, other.to_string()),
        }
    }
}
