//! Gossip transport
//!
//! Gossip messages are small JSON-serializable envelopes. The
//! [`GossipTransport`] trait sends one request to a peer's gossip address and
//! returns its reply; [`serve_gossip`] is the receiving side, shared by every
//! transport. [`InMemoryNetwork`] connects membership tasks in one process.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ClusterError, ClusterResult};
use crate::gossip::MembershipHandle;
use crate::node::MemberRecord;

/// Request on the gossip channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipRequest {
    /// Push-pull exchange of membership digests
    Exchange { records: Vec<MemberRecord> },
    /// Ask to be admitted to the cluster
    Join { record: MemberRecord },
}

/// Reply on the gossip channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GossipResponse {
    Records { records: Vec<MemberRecord> },
    Rejected { reason: String },
}

/// Client side of the gossip channel.
#[async_trait]
pub trait GossipTransport: Send + Sync {
    /// Deliver `request` to the node gossiping at `addr`.
    async fn send(&self, addr: &str, request: GossipRequest) -> ClusterResult<GossipResponse>;

    /// Exchange digests with `addr`.
    async fn exchange(&self, addr: &str, records: Vec<MemberRecord>) -> ClusterResult<Vec<MemberRecord>> {
        match self.send(addr, GossipRequest::Exchange { records }).await? {
            GossipResponse::Records { records } => Ok(records),
            GossipResponse::Rejected { reason } => Err(ClusterError::unreachable(addr, reason)),
        }
    }

    /// Ask `addr` to admit `record`.
    async fn join(&self, addr: &str, record: MemberRecord) -> ClusterResult<Vec<MemberRecord>> {
        match self.send(addr, GossipRequest::Join { record }).await? {
            GossipResponse::Records { records } => Ok(records),
            GossipResponse::Rejected { reason } => Err(ClusterError::JoinRejected {
                addr: addr.to_string(),
                reason,
            }),
        }
    }
}

/// Answer a gossip request using the local membership task.
pub async fn serve_gossip(handle: &MembershipHandle, request: GossipRequest) -> GossipResponse {
    let result = match request {
        GossipRequest::Exchange { records } => handle.exchange(records).await,
        GossipRequest::Join { record } => handle.join_request(record).await,
    };
    match result {
        Ok(records) => GossipResponse::Records { records },
        Err(e) => GossipResponse::Rejected { reason: e.to_string() },
    }
}

#[derive(Debug, Default)]
struct NetworkState {
    nodes: HashMap<String, MembershipHandle>,
    down: HashSet<String>,
}

/// In-process gossip network keyed by gossip address.
///
/// Nodes can be taken down and brought back to simulate partitions.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route requests for `addr` to `handle`.
    pub fn register(&self, addr: impl Into<String>, handle: MembershipHandle) {
        self.lock().nodes.insert(addr.into(), handle);
    }

    pub fn unregister(&self, addr: &str) {
        self.lock().nodes.remove(addr);
    }

    /// Make `addr` unreachable (or reachable again) without unregistering it.
    pub fn set_reachable(&self, addr: &str, reachable: bool) {
        let mut state = self.lock();
        if reachable {
            state.down.remove(addr);
        } else {
            state.down.insert(addr.to_string());
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, NetworkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl GossipTransport for InMemoryNetwork {
    async fn send(&self, addr: &str, request: GossipRequest) -> ClusterResult<GossipResponse> {
        let handle = {
            let state = self.lock();
            if state.down.contains(addr) {
                return Err(ClusterError::unreachable(addr, "partitioned"));
            }
            state.nodes.get(addr).cloned()
        };
        let handle = handle.ok_or_else(|| ClusterError::unreachable(addr, "no such node"))?;
        Ok(serve_gossip(&handle, request).await)
    }
}
