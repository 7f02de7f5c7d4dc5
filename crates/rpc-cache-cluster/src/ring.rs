//! Consistent-hash ring
//!
//! Each alive node is hashed onto a 64-bit circle at `vnodes` points derived
//! from its name alone. A key's owners are the distinct nodes met walking
//! clockwise from the key's own hash, so adding or removing a node only moves
//! the keys whose nearest point changed.
//!
//! A `Ring` is immutable; membership changes publish a new one.

use std::collections::HashSet;

use rpc_cache_protocol::ArtifactKey;
use sha2::{Digest, Sha256};

use crate::node::ClusterNode;

/// Virtual points per node.
pub const DEFAULT_VNODES: usize = 64;

/// Immutable snapshot of key placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ring {
    points: Vec<(u64, usize)>,
    nodes: Vec<ClusterNode>,
    replication: usize,
}

impl Ring {
    /// Build a ring over `nodes` with the default number of virtual points.
    pub fn build(nodes: impl IntoIterator<Item = ClusterNode>, replication: usize) -> Self {
        Self::with_vnodes(nodes, replication, DEFAULT_VNODES)
    }

    /// Build a ring with an explicit number of virtual points per node.
    ///
    /// Duplicate names keep the first node seen after sorting.
    pub fn with_vnodes(nodes: impl IntoIterator<Item = ClusterNode>, replication: usize, vnodes: usize) -> Self {
        let mut nodes: Vec<ClusterNode> = nodes.into_iter().collect();
        nodes.sort();
        nodes.dedup_by(|a, b| a.name == b.name);

        let vnodes = vnodes.max(1);
        let mut points = Vec::with_capacity(nodes.len() * vnodes);
        for (idx, node) in nodes.iter().enumerate() {
            for v in 0..vnodes {
                points.push((point_hash(&node.name, v), idx));
            }
        }
        // Ties between different names are broken by node order so every
        // member derives the same ring.
        points.sort_unstable();

        Self {
            points,
            nodes,
            replication: replication.max(1),
        }
    }

    /// Ring with no nodes.
    pub fn empty(replication: usize) -> Self {
        Self::build(Vec::new(), replication)
    }

    /// Ordered owner list for `key`: primary first, then replicas.
    ///
    /// Holds `min(replication, len())` distinct nodes.
    pub fn owners(&self, key: &ArtifactKey) -> Vec<&ClusterNode> {
        self.walk(key, self.replication)
    }

    /// Primary owner of `key`.
    pub fn primary(&self, key: &ArtifactKey) -> Option<&ClusterNode> {
        self.walk(key, 1).into_iter().next()
    }

    /// Whether `name` is among the owners of `key`.
    pub fn is_owner(&self, key: &ArtifactKey, name: &str) -> bool {
        self.owners(key).iter().any(|n| n.name == name)
    }

    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    pub fn node(&self, name: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.name == name)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn replication(&self) -> usize {
        self.replication
    }

    /// Whether this ring places keys on the same node set as `nodes`.
    pub fn has_members(&self, nodes: &[ClusterNode]) -> bool {
        self.nodes == nodes
    }

    fn walk(&self, key: &ArtifactKey, want: usize) -> Vec<&ClusterNode> {
        let want = want.min(self.nodes.len());
        let mut owners = Vec::with_capacity(want);
        if want == 0 {
            return owners;
        }

        let position = key_hash(key);
        let start = self.points.partition_point(|(p, _)| *p < position);
        let mut seen = HashSet::with_capacity(want);
        for i in 0..self.points.len() {
            let (_, idx) = self.points[(start + i) % self.points.len()];
            if seen.insert(idx) {
                owners.push(&self.nodes[idx]);
                if owners.len() == want {
                    break;
                }
            }
        }
        owners
    }
}

fn point_hash(name: &str, vnode: usize) -> u64 {
    let digest = Sha256::digest(format!("{}#{}", name, vnode).as_bytes());
    prefix_u64(&digest)
}

fn key_hash(key: &ArtifactKey) -> u64 {
    prefix_u64(&key.digest())
}

fn prefix_u64(bytes: &[u8]) -> u64 {
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&bytes[..8]);
    u64::from_be_bytes(prefix)
}
