//! Shared harness for router and server tests
//!
//! - [`TestCluster`]: routers over one in-process peer registry with a ring
//!   the test controls directly, so placement is deterministic
//! - PEM helpers for trust-set files
//! - [`eventually`] for asserting on background replication

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rpc_cache_cluster::{ClusterNode, Ring};
use rpc_cache_protocol::{ArtifactKey, Deadline};
use rpc_cache_server::router::standalone_ring;
use rpc_cache_server::{InProcessPeers, RequestRouter, RouterConfig};
use rpc_cache_store::{ArtifactStore, StoreConfig};
use tempfile::TempDir;
use tokio::sync::watch;

pub struct TestNode {
    pub node: ClusterNode,
    pub router: Arc<RequestRouter>,
    _dir: TempDir,
}

pub struct TestCluster {
    pub peers: InProcessPeers,
    pub nodes: Vec<TestNode>,
    ring: watch::Sender<Arc<Ring>>,
    replication: usize,
}

pub fn node(name: &str) -> ClusterNode {
    let addr = format!("{}:7946", name);
    ClusterNode::new(name, addr.clone(), addr)
}

impl TestCluster {
    /// Routers for `names`, all alive, with `replication` owners per key.
    pub fn new(names: &[&str], replication: usize) -> Self {
        Self::with_config(names, replication, RouterConfig::default())
    }

    pub fn with_config(names: &[&str], replication: usize, config: RouterConfig) -> Self {
        let members: Vec<ClusterNode> = names.iter().map(|n| node(n)).collect();
        let (ring, _) = watch::channel(Arc::new(Ring::build(members.clone(), replication)));
        let peers = InProcessPeers::new();

        let nodes = members
            .into_iter()
            .map(|member| {
                let dir = TempDir::new().unwrap();
                let store = Arc::new(ArtifactStore::open(StoreConfig::new(dir.path())).unwrap());
                let router = Arc::new(RequestRouter::new(
                    member.clone(),
                    store,
                    ring.subscribe(),
                    Arc::new(peers.clone()),
                    config.clone(),
                ));
                peers.register(member.name.clone(), &router);
                TestNode {
                    node: member,
                    router,
                    _dir: dir,
                }
            })
            .collect();

        Self {
            peers,
            nodes,
            ring,
            replication,
        }
    }

    pub fn router(&self, name: &str) -> &Arc<RequestRouter> {
        &self
            .nodes
            .iter()
            .find(|n| n.node.name == name)
            .unwrap_or_else(|| panic!("no node {}", name))
            .router
    }

    pub fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.ring.borrow())
    }

    /// Publish a ring over `names` only.
    pub fn set_alive(&self, names: &[&str]) {
        let members = names.iter().map(|n| node(n));
        self.ring.send_replace(Arc::new(Ring::build(members, self.replication)));
    }

    /// Whether `name`'s local store holds `key`.
    pub fn holds(&self, name: &str, key: &ArtifactKey) -> bool {
        self.router(name).store_handle().contains(key)
    }

    /// First key whose owners, in order, start with `owners` and exclude `not_owners`.
    pub fn key_placed(&self, owners: &[&str], not_owners: &[&str]) -> ArtifactKey {
        let ring = self.ring();
        (0..10_000)
            .map(|i| ArtifactKey::parse(format!("pkg/target/{}", i)).unwrap())
            .find(|key| {
                let placed: Vec<&str> = ring.owners(key).into_iter().map(|n| n.name.as_str()).collect();
                placed.starts_with(owners) && !placed.iter().any(|n| not_owners.contains(n))
            })
            .unwrap_or_else(|| panic!("no key placed on {:?} avoiding {:?}", owners, not_owners))
    }
}

/// A standalone router over a fresh store.
pub fn standalone_router(dir: &TempDir) -> Arc<RequestRouter> {
    let store = Arc::new(ArtifactStore::open(StoreConfig::new(dir.path())).unwrap());
    let local = node("solo");
    let ring = standalone_ring(&local);
    Arc::new(RequestRouter::new(
        local,
        store,
        ring,
        Arc::new(InProcessPeers::new()),
        RouterConfig::default(),
    ))
}

pub fn deadline() -> Deadline {
    Deadline::after(Duration::from_secs(5))
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// A PEM CERTIFICATE block around arbitrary DER bytes.
pub fn pem_certificate(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut out = String::from("-----BEGIN CERTIFICATE-----\n");
    for chunk in encoded.as_bytes().chunks(64) {
        out.push_str(std::str::from_utf8(chunk).unwrap());
        out.push('\n');
    }
    out.push_str("-----END CERTIFICATE-----\n");
    out
}
