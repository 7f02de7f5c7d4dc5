//! RPC Cache Cluster
//!
//! Membership and placement for a cluster of cache servers:
//! - `node`: node identity and gossip state
//! - `membership`: the membership table with merge and failure detection
//! - `ring`: consistent-hash placement of keys on alive nodes
//! - `gossip`: the task that owns membership and publishes ring snapshots
//! - `bootstrap`: seed / join / standalone decision and execution
//! - `transport`: gossip message envelopes and the transport seam

pub mod bootstrap;
pub mod error;
pub mod gossip;
pub mod membership;
pub mod node;
pub mod ring;
pub mod transport;

pub use bootstrap::{join_cluster, seed_cluster, BootstrapConfig, BootstrapPlan, JoinRetry, Resolver, SystemResolver};
pub use error::{ClusterError, ClusterResult};
pub use gossip::{startup_epoch, GossipConfig, Membership, MembershipHandle};
pub use membership::{MembershipConfig, MembershipTable, Transition};
pub use node::{ClusterNode, MemberRecord, NodeState};
pub use ring::{Ring, DEFAULT_VNODES};
pub use transport::{serve_gossip, GossipRequest, GossipResponse, GossipTransport, InMemoryNetwork};
