//! Peer RPC seam
//!
//! The router reaches other nodes through [`PeerClient`]. The TCP transport
//! implements it for real clusters; [`InProcessPeers`] dispatches directly to
//! other routers in the same process for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use async_trait::async_trait;
use rpc_cache_cluster::ClusterNode;
use rpc_cache_protocol::{CacheError, PeerRequest};

use super::RequestRouter;

/// Failure of a single peer call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PeerError {
    /// The peer could not be reached or did not answer in time
    #[error("peer {node} unreachable: {reason}")]
    Unreachable { node: String, reason: String },

    /// The peer answered with an error
    #[error("peer answered {0}")]
    Remote(CacheError),
}

impl PeerError {
    pub fn unreachable(node: &ClusterNode, reason: impl ToString) -> Self {
        Self::Unreachable {
            node: node.name.clone(),
            reason: reason.to_string(),
        }
    }

    /// Whether the next owner may be tried instead.
    pub fn is_retryable(&self) -> bool {
        match self {
            PeerError::Unreachable { .. } => true,
            PeerError::Remote(e) => e.code.is_retryable(),
        }
    }
}

/// Sends cluster-internal requests to other nodes.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// Deliver `request` to `node` and return its payload, if any.
    async fn call(&self, node: &ClusterNode, request: PeerRequest) -> Result<Option<Vec<u8>>, PeerError>;
}

#[derive(Default)]
struct Registry {
    routers: HashMap<String, Weak<RequestRouter>>,
    down: HashSet<String>,
}

/// Routes peer calls to routers in this process, keyed by node name.
#[derive(Clone, Default)]
pub struct InProcessPeers {
    registry: Arc<Mutex<Registry>>,
}

impl InProcessPeers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, router: &Arc<RequestRouter>) {
        self.lock().routers.insert(name.into(), Arc::downgrade(router));
    }

    /// Make `name` unreachable (or reachable again).
    pub fn set_reachable(&self, name: &str, reachable: bool) {
        let mut registry = self.lock();
        if reachable {
            registry.down.remove(name);
        } else {
            registry.down.insert(name.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl PeerClient for InProcessPeers {
    async fn call(&self, node: &ClusterNode, request: PeerRequest) -> Result<Option<Vec<u8>>, PeerError> {
        let router = {
            let registry = self.lock();
            if registry.down.contains(&node.name) {
                return Err(PeerError::unreachable(node, "partitioned"));
            }
            registry.routers.get(&node.name).and_then(Weak::upgrade)
        };
        let router = router.ok_or_else(|| PeerError::unreachable(node, "no such node"))?;
        router.handle_peer(request).await.map_err(PeerError::Remote)
    }
}
