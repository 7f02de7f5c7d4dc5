//! Request routing
//!
//! The [`RequestRouter`] serves store, retrieve and delete against the ring
//! snapshot current when the request arrives:
//! - Store: the primary (or any owner when writes are not forwarded) writes
//!   locally and replicates to the other owners in the background. Other
//!   nodes forward to the primary, retry once on the next owner, and
//!   otherwise write locally and tag the key for repair.
//! - Retrieve: local store first, then owners in preference order.
//! - Delete: always local, then broadcast to owners or forwarded like a
//!   store.
//!
//! Peer requests carry the remaining deadline budget. When it runs out
//! before a forward completes, the router falls back to local semantics.

pub mod peer;
pub mod repair;

use std::sync::Arc;
use std::time::Duration;

use rpc_cache_cluster::{ClusterNode, Ring};
use rpc_cache_protocol::ops::Operation;
use rpc_cache_protocol::{
    ArtifactKey, CacheError, CacheResult, Capability, Deadline, PeerMode, PeerRequest, RpcRequest, RpcResponse,
};
use rpc_cache_store::{ArtifactStore, StoreError};
use tokio::sync::watch;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

pub use peer::{InProcessPeers, PeerClient, PeerError};
pub use repair::{spawn_repair, RepairOp, RepairQueue, RepairReport};

/// Router settings.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Send writes received by a non-primary owner to the primary
    pub forward_writes: bool,
    /// Upper bound on any request
    pub request_timeout: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            forward_writes: true,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Serves cache operations for one node.
pub struct RequestRouter {
    local: ClusterNode,
    store: Arc<ArtifactStore>,
    ring: watch::Receiver<Arc<Ring>>,
    peers: Arc<dyn PeerClient>,
    repair: Arc<RepairQueue>,
    replication: TaskTracker,
    config: RouterConfig,
}

impl std::fmt::Debug for RequestRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestRouter")
            .field("local", &self.local)
            .field("ring_len", &self.ring.borrow().len())
            .field("repair_backlog", &self.repair.len())
            .finish()
    }
}

/// Ring source for a node that is not part of a cluster.
pub fn standalone_ring(local: &ClusterNode) -> watch::Receiver<Arc<Ring>> {
    let (_tx, rx) = watch::channel(Arc::new(Ring::build([local.clone()], 1)));
    rx
}

impl RequestRouter {
    pub fn new(
        local: ClusterNode,
        store: Arc<ArtifactStore>,
        ring: watch::Receiver<Arc<Ring>>,
        peers: Arc<dyn PeerClient>,
        config: RouterConfig,
    ) -> Self {
        Self {
            local,
            store,
            ring,
            peers,
            repair: Arc::new(RepairQueue::new()),
            replication: TaskTracker::new(),
            config,
        }
    }

    pub fn local(&self) -> &ClusterNode {
        &self.local
    }

    pub fn store_handle(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    pub fn repair_queue(&self) -> &RepairQueue {
        &self.repair
    }

    /// The ring snapshot a new request would use.
    pub fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.ring.borrow())
    }

    /// Serve a client request with the caller's capability.
    pub async fn handle(&self, capability: Capability, request: RpcRequest) -> RpcResponse {
        let request_id = request.request_id.clone();
        let result = self.dispatch(capability, request).await;
        if let Err(e) = &result {
            debug!(request_id = %request_id, code = %e.code, "request failed: {}", e.message);
        }
        RpcResponse::from_result(request_id, result)
    }

    async fn dispatch(&self, capability: Capability, request: RpcRequest) -> CacheResult<Option<Vec<u8>>> {
        let op = request.operation()?;
        capability.require(op.required_capability(), op.as_str())?;

        let deadline = Deadline::from_request(request.timeout_ms, self.config.request_timeout);
        if deadline.is_expired() {
            return Err(CacheError::deadline_exceeded(op.as_str()));
        }

        match op {
            Operation::Store => {
                let payload = request
                    .payload
                    .ok_or_else(|| CacheError::invalid_request("store requires a payload"))?;
                self.store(&request.key, payload, deadline).await.map(|_| None)
            }
            Operation::Retrieve => self.retrieve(&request.key, deadline).await.map(Some),
            Operation::Delete => self.delete(&request.key, deadline).await.map(|_| None),
        }
    }

    /// Store `payload` under `key`.
    pub async fn store(&self, key: &ArtifactKey, payload: Vec<u8>, deadline: Deadline) -> CacheResult<()> {
        let ring = self.ring();
        let owners = ring.owners(key);

        let serve_locally = owners.is_empty()
            || if self.config.forward_writes {
                owners[0].name == self.local.name
            } else {
                owners.iter().any(|n| n.name == self.local.name)
            };

        if serve_locally {
            self.store.put(key, &payload).await?;
            if owners.is_empty() {
                // No ring yet; deliver once membership settles.
                self.repair.tag(key.clone(), RepairOp::Store);
            } else {
                self.replicate(&ring, key, Operation::Store, Some(payload), deadline);
            }
            return Ok(());
        }

        let request = self.peer_request(Operation::Store, key, Some(payload.clone()), PeerMode::Forward, deadline);
        match self.forward(&owners, request, deadline).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_retryable() => {
                warn!(key = %key, "forward failed, storing locally for repair: {}", e);
                self.store.put(key, &payload).await?;
                self.repair.tag(key.clone(), RepairOp::Store);
                Ok(())
            }
            Err(PeerError::Remote(e)) => Err(e),
            Err(e) => Err(CacheError::storage(e.to_string())),
        }
    }

    /// Fetch the payload stored under `key`, locally or from an owner.
    pub async fn retrieve(&self, key: &ArtifactKey, deadline: Deadline) -> CacheResult<Vec<u8>> {
        match self.store.get(key).await {
            Ok(payload) => return Ok(payload),
            Err(StoreError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let ring = self.ring();
        let mut unreachable = Vec::new();
        let mut answered = false;
        for owner in ring.owners(key).into_iter().filter(|n| n.name != self.local.name) {
            let request = self.peer_request(Operation::Retrieve, key, None, PeerMode::Replicate, deadline);
            match self.call_peer(owner, request, deadline).await {
                Ok(Some(payload)) => {
                    debug!(key = %key, owner = %owner.name, "retrieved from owner");
                    return Ok(payload);
                }
                Ok(None) => {
                    answered = true;
                    warn!(key = %key, owner = %owner.name, "owner answered retrieve without payload");
                }
                Err(PeerError::Remote(e)) if e.is_not_found() => answered = true,
                Err(e) => {
                    debug!(key = %key, owner = %owner.name, "owner lookup failed: {}", e);
                    unreachable.push(owner.name.clone());
                }
            }
        }

        if !answered && !unreachable.is_empty() {
            return Err(CacheError::cluster_unavailable(&unreachable));
        }
        Err(CacheError::not_found(key))
    }

    /// Delete `key` locally and from its owners. Absent keys are not an error.
    pub async fn delete(&self, key: &ArtifactKey, deadline: Deadline) -> CacheResult<()> {
        self.store.delete(key).await?;

        let ring = self.ring();
        let owners = ring.owners(key);
        if owners.is_empty() {
            self.repair.tag(key.clone(), RepairOp::Delete);
            return Ok(());
        }
        if owners.iter().any(|n| n.name == self.local.name) {
            self.replicate(&ring, key, Operation::Delete, None, deadline);
            return Ok(());
        }

        let request = self.peer_request(Operation::Delete, key, None, PeerMode::Forward, deadline);
        if let Err(e) = self.forward(&owners, request, deadline).await {
            warn!(key = %key, "delete forward failed, tagging for repair: {}", e);
            self.repair.tag(key.clone(), RepairOp::Delete);
        }
        Ok(())
    }

    /// Serve a request from another node.
    ///
    /// The origin must be a member of the current ring; anything else is
    /// `UNAUTHENTICATED` and never reaches the store.
    pub async fn handle_peer(&self, request: PeerRequest) -> CacheResult<Option<Vec<u8>>> {
        if self.ring().node(&request.origin).is_none() {
            warn!(origin = %request.origin, key = %request.key, "rejected peer request from non-member");
            return Err(CacheError::unauthenticated(format!(
                "{} is not a member of this cluster",
                request.origin
            )));
        }
        let deadline = Deadline::from_budget_ms(request.budget_ms).capped(self.config.request_timeout);
        let key = &request.key;
        debug!(
            key = %key,
            op = request.op.as_str(),
            origin = %request.origin,
            mode = ?request.mode,
            "peer request"
        );

        match (request.op, request.mode) {
            (Operation::Store, mode) => {
                let payload = request
                    .payload
                    .ok_or_else(|| CacheError::invalid_request("store requires a payload"))?;
                self.store.put(key, &payload).await?;
                if mode == PeerMode::Forward {
                    self.replicate(&self.ring(), key, Operation::Store, Some(payload), deadline);
                }
                Ok(None)
            }
            (Operation::Retrieve, _) => Ok(Some(self.store.get(key).await?)),
            (Operation::Delete, mode) => {
                self.store.delete(key).await?;
                if mode == PeerMode::Forward {
                    self.replicate(&self.ring(), key, Operation::Delete, None, deadline);
                }
                Ok(None)
            }
        }
    }

    /// Re-attempt delivery of every tagged key.
    pub async fn repair_pass(&self) -> RepairReport {
        let mut report = RepairReport::default();
        let ring = self.ring();

        for (key, op) in self.repair.drain() {
            report.attempted += 1;
            let deadline = Deadline::after(self.config.request_timeout);
            let delivered = match op {
                RepairOp::Store => match self.store.get(&key).await {
                    Ok(payload) => self.deliver(&ring, &key, Operation::Store, Some(payload), deadline).await,
                    // Deleted or evicted since; nothing left to deliver.
                    Err(StoreError::NotFound(_)) => true,
                    Err(e) => {
                        warn!(key = %key, "repair read failed: {}", e);
                        false
                    }
                },
                RepairOp::Delete => self.deliver(&ring, &key, Operation::Delete, None, deadline).await,
            };

            if delivered {
                report.repaired += 1;
                debug!(key = %key, op = ?op, "repaired");
            } else {
                report.deferred += 1;
                self.repair.retag(key, op);
            }
        }
        report
    }

    /// Wait for outstanding replication to finish.
    pub async fn drain(&self) {
        self.replication.close();
        self.replication.wait().await;
        info!(repair_backlog = self.repair.len(), "replication drained");
    }

    async fn deliver(
        &self,
        ring: &Ring,
        key: &ArtifactKey,
        op: Operation,
        payload: Option<Vec<u8>>,
        deadline: Deadline,
    ) -> bool {
        let owners = ring.owners(key);
        if owners.is_empty() {
            return false;
        }

        if owners[0].name == self.local.name {
            let mut all = true;
            for owner in owners.iter().skip(1) {
                let request = self.peer_request(op, key, payload.clone(), PeerMode::Replicate, deadline);
                if let Err(e) = self.call_peer(owner, request, deadline).await {
                    debug!(key = %key, owner = %owner.name, "repair replication failed: {}", e);
                    all = false;
                }
            }
            return all;
        }

        let request = self.peer_request(op, key, payload, PeerMode::Forward, deadline);
        self.forward(&owners, request, deadline).await.is_ok()
    }

    /// Send to the first owner other than this node, retrying once on the next.
    async fn forward(
        &self,
        owners: &[&ClusterNode],
        request: PeerRequest,
        deadline: Deadline,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        let mut last = None;
        for owner in owners.iter().filter(|n| n.name != self.local.name).take(2) {
            match self.call_peer(owner, request.clone(), deadline).await {
                Ok(payload) => return Ok(payload),
                Err(e) if e.is_retryable() => {
                    debug!(key = %request.key, owner = %owner.name, "forward failed: {}", e);
                    last = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last.unwrap_or_else(|| PeerError::Unreachable {
            node: "-".to_string(),
            reason: "no other owner".to_string(),
        }))
    }

    async fn call_peer(
        &self,
        node: &ClusterNode,
        mut request: PeerRequest,
        deadline: Deadline,
    ) -> Result<Option<Vec<u8>>, PeerError> {
        let remaining = deadline.remaining();
        if remaining.is_zero() {
            return Err(PeerError::unreachable(node, "deadline exhausted"));
        }
        request.budget_ms = deadline.budget_ms();
        match tokio::time::timeout(remaining, self.peers.call(node, request)).await {
            Ok(result) => result,
            Err(_) => Err(PeerError::unreachable(node, "deadline exhausted")),
        }
    }

    /// Best-effort copy to every owner but this node.
    ///
    /// Failures tag the key so the repair task retries delivery.
    fn replicate(&self, ring: &Ring, key: &ArtifactKey, op: Operation, payload: Option<Vec<u8>>, deadline: Deadline) {
        let targets: Vec<ClusterNode> = ring
            .owners(key)
            .into_iter()
            .filter(|n| n.name != self.local.name)
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }

        let budget = deadline.remaining();
        for target in targets {
            let request = self.peer_request(op, key, payload.clone(), PeerMode::Replicate, deadline);
            let peers = Arc::clone(&self.peers);
            let repair = Arc::clone(&self.repair);
            self.replication.spawn(async move {
                let key = request.key.clone();
                let result = match tokio::time::timeout(budget, peers.call(&target, request)).await {
                    Ok(result) => result,
                    Err(_) => Err(PeerError::unreachable(&target, "deadline exhausted")),
                };
                if let Err(e) = result {
                    warn!(key = %key, owner = %target.name, op = op.as_str(), "replication failed: {}", e);
                    repair.retag(key, repair_op(op));
                }
            });
        }
    }

    fn peer_request(
        &self,
        op: Operation,
        key: &ArtifactKey,
        payload: Option<Vec<u8>>,
        mode: PeerMode,
        deadline: Deadline,
    ) -> PeerRequest {
        PeerRequest {
            request_id: ulid::Ulid::new().to_string(),
            op,
            key: key.clone(),
            payload,
            mode,
            budget_ms: deadline.budget_ms(),
            origin: self.local.name.clone(),
        }
    }
}

fn repair_op(op: Operation) -> RepairOp {
    match op {
        Operation::Delete => RepairOp::Delete,
        Operation::Store | Operation::Retrieve => RepairOp::Store,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_cache_protocol::ErrorCode;
    use rpc_cache_store::StoreConfig;
    use tempfile::TempDir;

    fn standalone() -> (TempDir, RequestRouter) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(ArtifactStore::open(StoreConfig::new(dir.path())).unwrap());
        let local = ClusterNode::new("solo", "127.0.0.1:7946", "127.0.0.1:7946");
        let ring = standalone_ring(&local);
        let router = RequestRouter::new(local, store, ring, Arc::new(InProcessPeers::new()), RouterConfig::default());
        (dir, router)
    }

    fn key(s: &str) -> ArtifactKey {
        ArtifactKey::parse(s).unwrap()
    }

    #[tokio::test]
    async fn test_standalone_round_trip() {
        let (_dir, router) = standalone();
        let put = RpcRequest::new(Operation::Store, "r1", key("pkg/a/1")).with_payload(b"abc".to_vec());
        assert!(router.handle(Capability::Write, put).await.ok);

        let get = RpcRequest::new(Operation::Retrieve, "r2", key("pkg/a/1"));
        let resp = router.handle(Capability::Read, get).await;
        assert_eq!(resp.payload.as_deref(), Some(&b"abc"[..]));
        assert!(router.repair_queue().is_empty());
    }

    #[tokio::test]
    async fn test_capability_enforced() {
        let (_dir, router) = standalone();
        let put = RpcRequest::new(Operation::Store, "r1", key("pkg/a/1")).with_payload(b"abc".to_vec());
        let resp = router.handle(Capability::Read, put).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::PermissionDenied);

        let del = RpcRequest::new(Operation::Delete, "r2", key("pkg/a/1"));
        let resp = router.handle(Capability::Read, del).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::PermissionDenied);

        let get = RpcRequest::new(Operation::Retrieve, "r3", key("pkg/a/1"));
        let resp = router.handle(Capability::None, get).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::PermissionDenied);
    }

    #[tokio::test]
    async fn test_store_without_payload_is_invalid() {
        let (_dir, router) = standalone();
        let put = RpcRequest::new(Operation::Store, "r1", key("pkg/a/1"));
        let resp = router.handle(Capability::Write, put).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::InvalidRequest);
    }

    #[tokio::test]
    async fn test_standalone_miss_is_not_found() {
        let (_dir, router) = standalone();
        let get = RpcRequest::new(Operation::Retrieve, "r1", key("pkg/missing/1"));
        let resp = router.handle(Capability::Read, get).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds() {
        let (_dir, router) = standalone();
        for id in ["r1", "r2"] {
            let del = RpcRequest::new(Operation::Delete, id, key("pkg/never/1"));
            assert!(router.handle(Capability::Write, del).await.ok);
        }
    }

    #[tokio::test]
    async fn test_zero_budget_is_deadline_exceeded() {
        let (_dir, router) = standalone();
        let get = RpcRequest::new(Operation::Retrieve, "r1", key("pkg/a/1")).with_timeout_ms(0);
        let resp = router.handle(Capability::Read, get).await;
        assert_eq!(resp.error.unwrap().code, ErrorCode::DeadlineExceeded);
    }
}
