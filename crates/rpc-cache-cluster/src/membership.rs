//! Membership table
//!
//! Holds this node's view of the cluster and applies the gossip merge and
//! failure-detection rules:
//! - Records are ordered by `(epoch, heartbeat)`; a higher epoch always wins
//! - Within an epoch `Dead` is terminal, which damps flapping
//! - A fresh heartbeat returns a `Suspect` member to `Alive`
//! - `Alive` turns `Suspect` after `missed_heartbeats` silent intervals,
//!   `Suspect` turns `Dead` after `dead_timeout`, and `Dead` records are purged
//!   after `dead_retention`
//! - Gossip claiming this node is suspect or dead is refuted by bumping the epoch
//!
//! The table is plain data. It is owned by the membership task and never
//! shared with request handlers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{ClusterError, ClusterResult};
use crate::node::{ClusterNode, MemberRecord, NodeState};

/// Failure detection timing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MembershipConfig {
    /// Interval at which members heartbeat
    pub heartbeat_interval: Duration,
    /// Silent intervals before a member is suspected
    pub missed_heartbeats: u32,
    /// Time a member may stay suspect before it is declared dead
    pub dead_timeout: Duration,
    /// Time a dead member is kept before it is forgotten
    pub dead_retention: Duration,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(1),
            missed_heartbeats: 3,
            dead_timeout: Duration::from_secs(15),
            dead_retention: Duration::from_secs(60),
        }
    }
}

impl MembershipConfig {
    /// Silence after which an alive member becomes suspect.
    pub fn suspect_after(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }
}

/// A state change of one member, `None` meaning absent from the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub name: String,
    pub from: Option<NodeState>,
    pub to: Option<NodeState>,
}

impl fmt::Display for Transition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |s: Option<NodeState>| s.map(|s| s.as_str()).unwrap_or("absent");
        write!(f, "{}: {} -> {}", self.name, show(self.from), show(self.to))
    }
}

#[derive(Debug, Clone)]
struct Entry {
    record: MemberRecord,
    last_seen: Instant,
    state_since: Instant,
}

impl Entry {
    fn new(record: MemberRecord, now: Instant) -> Self {
        Self {
            record,
            last_seen: now,
            state_since: now,
        }
    }

    fn set_state(&mut self, state: NodeState, now: Instant) -> Option<Transition> {
        if self.record.state == state {
            return None;
        }
        let from = self.record.state;
        self.record.state = state;
        self.state_since = now;
        Some(Transition {
            name: self.record.node.name.clone(),
            from: Some(from),
            to: Some(state),
        })
    }
}

/// This node's view of cluster membership.
#[derive(Debug, Clone)]
pub struct MembershipTable {
    local: MemberRecord,
    peers: BTreeMap<String, Entry>,
    config: MembershipConfig,
}

impl MembershipTable {
    /// Table containing only the local node, in `Joining` state.
    pub fn new(local: ClusterNode, epoch: u64, config: MembershipConfig) -> Self {
        Self {
            local: MemberRecord::new(local, epoch),
            peers: BTreeMap::new(),
            config,
        }
    }

    pub fn config(&self) -> &MembershipConfig {
        &self.config
    }

    pub fn local(&self) -> &MemberRecord {
        &self.local
    }

    /// Record for `name`, including the local node.
    pub fn get(&self, name: &str) -> Option<&MemberRecord> {
        if name == self.local.node.name {
            return Some(&self.local);
        }
        self.peers.get(name).map(|e| &e.record)
    }

    /// Mark the local node `Alive` once it has seeded or joined.
    pub fn activate(&mut self) -> Option<Transition> {
        self.set_local_state(NodeState::Alive)
    }

    /// Announce the local node as leaving.
    pub fn leave(&mut self) -> Option<Transition> {
        self.set_local_state(NodeState::Dead)
    }

    /// Advance the local heartbeat for the next gossip round.
    pub fn beat(&mut self) {
        self.local.heartbeat += 1;
    }

    /// Contradict gossip about the local node by moving past `seen_epoch`.
    pub fn refute(&mut self, seen_epoch: u64) -> Option<Transition> {
        self.local.epoch = self.local.epoch.max(seen_epoch) + 1;
        self.local.heartbeat = 0;
        self.set_local_state(NodeState::Alive)
    }

    /// Merge records received from a peer.
    pub fn merge(&mut self, incoming: impl IntoIterator<Item = MemberRecord>, now: Instant) -> Vec<Transition> {
        let mut transitions = Vec::new();
        for record in incoming {
            if record.node.name == self.local.node.name {
                transitions.extend(self.merge_local(&record));
            } else {
                transitions.extend(self.merge_peer(record, now));
            }
        }
        transitions
    }

    /// Admit a node asking to join.
    ///
    /// Rejected when the name belongs to this node or to a member that is
    /// still live at different endpoints.
    pub fn admit(&mut self, joiner: MemberRecord, now: Instant) -> ClusterResult<Option<Transition>> {
        let name = joiner.node.name.clone();
        if name == self.local.node.name {
            return Err(ClusterError::NameCollision {
                name,
                holder: self.local.node.gossip_addr.clone(),
            });
        }
        let from = match self.peers.get(&name) {
            Some(existing) => {
                if existing.record.state != NodeState::Dead && !existing.record.node.same_endpoints(&joiner.node) {
                    return Err(ClusterError::NameCollision {
                        name,
                        holder: existing.record.node.gossip_addr.clone(),
                    });
                }
                Some(existing.record.state)
            }
            None => None,
        };
        let to = joiner.state;
        self.peers.insert(name.clone(), Entry::new(joiner, now));
        Ok((from != Some(to)).then_some(Transition {
            name,
            from,
            to: Some(to),
        }))
    }

    /// Run failure detection as of `now`.
    pub fn tick(&mut self, now: Instant) -> Vec<Transition> {
        let suspect_after = self.config.suspect_after();
        let mut transitions = Vec::new();
        let mut purge = Vec::new();

        for (name, entry) in self.peers.iter_mut() {
            let silent = now.saturating_duration_since(entry.last_seen);
            let in_state = now.saturating_duration_since(entry.state_since);
            match entry.record.state {
                NodeState::Joining | NodeState::Alive if silent > suspect_after => {
                    transitions.extend(entry.set_state(NodeState::Suspect, now));
                }
                NodeState::Suspect if in_state > self.config.dead_timeout => {
                    transitions.extend(entry.set_state(NodeState::Dead, now));
                }
                NodeState::Dead if in_state > self.config.dead_retention => {
                    purge.push(name.clone());
                }
                _ => {}
            }
        }

        for name in purge {
            self.peers.remove(&name);
            transitions.push(Transition {
                name,
                from: Some(NodeState::Dead),
                to: None,
            });
        }
        transitions
    }

    /// Nodes currently in the ring, sorted by name.
    pub fn alive_nodes(&self) -> Vec<ClusterNode> {
        let mut nodes: Vec<ClusterNode> = self
            .records()
            .into_iter()
            .filter(|r| r.state.in_ring())
            .map(|r| r.node)
            .collect();
        nodes.sort();
        nodes
    }

    /// Every known record, local node first.
    pub fn records(&self) -> Vec<MemberRecord> {
        std::iter::once(self.local.clone())
            .chain(self.peers.values().map(|e| e.record.clone()))
            .collect()
    }

    /// Peers worth gossiping with: everything not known dead.
    pub fn gossip_targets(&self) -> Vec<ClusterNode> {
        self.peers
            .values()
            .filter(|e| e.record.state != NodeState::Dead)
            .map(|e| e.record.node.clone())
            .collect()
    }

    /// Number of members, including the local node, in `state`.
    pub fn count(&self, state: NodeState) -> usize {
        self.records().iter().filter(|r| r.state == state).count()
    }

    fn set_local_state(&mut self, state: NodeState) -> Option<Transition> {
        if self.local.state == state {
            return None;
        }
        let from = self.local.state;
        self.local.state = state;
        Some(Transition {
            name: self.local.node.name.clone(),
            from: Some(from),
            to: Some(state),
        })
    }

    fn merge_local(&mut self, record: &MemberRecord) -> Option<Transition> {
        if self.local.state == NodeState::Dead {
            return None;
        }
        let doubted = matches!(record.state, NodeState::Suspect | NodeState::Dead);
        let newer_claim = record.epoch > self.local.epoch;
        if newer_claim || (record.epoch == self.local.epoch && doubted) {
            return self.refute(record.epoch);
        }
        None
    }

    fn merge_peer(&mut self, record: MemberRecord, now: Instant) -> Option<Transition> {
        let name = record.node.name.clone();
        let Some(entry) = self.peers.get_mut(&name) else {
            let to = record.state;
            self.peers.insert(name.clone(), Entry::new(record, now));
            return Some(Transition {
                name,
                from: None,
                to: Some(to),
            });
        };

        if record.epoch < entry.record.epoch {
            return None;
        }
        if record.epoch > entry.record.epoch {
            return Self::replace(entry, record, now);
        }

        // Two claims for one name in the same epoch: the larger address wins
        // everywhere, so every member converges on the same holder.
        if !record.node.same_endpoints(&entry.record.node) {
            if record.node.gossip_addr > entry.record.node.gossip_addr {
                return Self::replace(entry, record, now);
            }
            return None;
        }

        if entry.record.state == NodeState::Dead {
            return None;
        }
        if record.state == NodeState::Dead {
            entry.record.heartbeat = entry.record.heartbeat.max(record.heartbeat);
            return entry.set_state(NodeState::Dead, now);
        }

        let fresh = record.heartbeat > entry.record.heartbeat;
        let activated = entry.record.state == NodeState::Joining && record.state == NodeState::Alive;
        if !fresh && !activated {
            return None;
        }
        entry.record.heartbeat = entry.record.heartbeat.max(record.heartbeat);
        entry.last_seen = now;
        let state = match record.state {
            NodeState::Joining => NodeState::Joining,
            _ => NodeState::Alive,
        };
        entry.set_state(state, now)
    }

    fn replace(entry: &mut Entry, record: MemberRecord, now: Instant) -> Option<Transition> {
        let from = entry.record.state;
        let to = record.state;
        *entry = Entry::new(record, now);
        (from != to).then(|| Transition {
            name: entry.record.node.name.clone(),
            from: Some(from),
            to: Some(to),
        })
    }
}
