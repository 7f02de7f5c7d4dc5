//! Cluster node identity and gossip state.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A cache server taking part in the cluster.
///
/// A node's ring position depends only on `name`, so names must be unique
/// among live members.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Unique node name
    pub name: String,
    /// Address peers gossip with
    pub gossip_addr: String,
    /// Address peers send forwarded and replicated requests to
    pub rpc_addr: String,
}

impl ClusterNode {
    pub fn new(name: impl Into<String>, gossip_addr: impl Into<String>, rpc_addr: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gossip_addr: gossip_addr.into(),
            rpc_addr: rpc_addr.into(),
        }
    }

    /// Whether `other` advertises the same endpoints.
    pub fn same_endpoints(&self, other: &ClusterNode) -> bool {
        self.gossip_addr == other.gossip_addr && self.rpc_addr == other.rpc_addr
    }
}

impl fmt::Display for ClusterNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.gossip_addr)
    }
}

/// Gossip state of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Admitted but not yet serving
    Joining,
    /// Heartbeating and part of the ring
    Alive,
    /// Missed heartbeats; still in membership, out of the ring
    Suspect,
    /// Gone; kept in history for a while to damp flapping
    Dead,
}

impl NodeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeState::Joining => "joining",
            NodeState::Alive => "alive",
            NodeState::Suspect => "suspect",
            NodeState::Dead => "dead",
        }
    }

    /// Whether a node in this state owns ring partitions.
    pub fn in_ring(&self) -> bool {
        *self == NodeState::Alive
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One member's entry as exchanged in gossip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberRecord {
    pub node: ClusterNode,
    /// Join epoch; a node bumps it on restart or to refute a false death
    pub epoch: u64,
    /// Monotonic within an epoch, incremented by the node itself every round
    pub heartbeat: u64,
    pub state: NodeState,
}

impl MemberRecord {
    pub fn new(node: ClusterNode, epoch: u64) -> Self {
        Self {
            node,
            epoch,
            heartbeat: 0,
            state: NodeState::Joining,
        }
    }

    pub fn name(&self) -> &str {
        &self.node.name
    }

    pub fn with_state(mut self, state: NodeState) -> Self {
        self.state = state;
        self
    }
}
