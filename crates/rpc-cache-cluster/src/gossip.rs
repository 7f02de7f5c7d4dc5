//! Gossip membership task
//!
//! A single task owns the [`MembershipTable`]. Everything else talks to it
//! through a [`MembershipHandle`]:
//! - Inbound gossip and join requests are commands answered over oneshots
//! - Every interval the task heartbeats, runs failure detection and spawns
//!   exchanges with a few random peers; their replies come back as commands
//! - The ring is rebuilt whenever the alive set changes and published through
//!   a `watch` channel, so request handlers read it without locking
//!
//! The task never awaits the network while handling a command. Outbound
//! exchanges run in their own tasks, so two members gossiping with each other
//! cannot wait on one another.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::seq::SliceRandom;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::membership::{MembershipConfig, MembershipTable, Transition};
use crate::node::{ClusterNode, MemberRecord};
use crate::ring::Ring;
use crate::transport::GossipTransport;

const COMMAND_BUFFER: usize = 256;

/// Gossip task settings.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    /// Failure detection timing; its heartbeat interval is also the gossip round
    pub membership: MembershipConfig,
    /// Peers contacted per round
    pub fanout: usize,
    /// Upper bound on one outbound exchange
    pub exchange_timeout: Duration,
    /// Time allowed for announcing departure on shutdown
    pub leave_timeout: Duration,
    /// Owners per key in published rings
    pub replication_factor: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            membership: MembershipConfig::default(),
            fanout: 3,
            exchange_timeout: Duration::from_secs(2),
            leave_timeout: Duration::from_secs(1),
            replication_factor: 2,
        }
    }
}

/// Epoch for a node starting now.
///
/// Wall-clock milliseconds, so a restarted node outranks its previous
/// incarnation.
pub fn startup_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(1)
}

enum Command {
    Exchange {
        records: Vec<MemberRecord>,
        reply: oneshot::Sender<Vec<MemberRecord>>,
    },
    Join {
        record: MemberRecord,
        reply: oneshot::Sender<ClusterResult<Vec<MemberRecord>>>,
    },
    Merge(Vec<MemberRecord>),
    Activate {
        reply: oneshot::Sender<()>,
    },
    Members {
        reply: oneshot::Sender<Vec<MemberRecord>>,
    },
}

/// Cloneable access to the membership task.
#[derive(Debug, Clone)]
pub struct MembershipHandle {
    local: ClusterNode,
    commands: mpsc::Sender<Command>,
    ring: watch::Receiver<Arc<Ring>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Command::Exchange { .. } => "Exchange",
            Command::Join { .. } => "Join",
            Command::Merge(_) => "Merge",
            Command::Activate { .. } => "Activate",
            Command::Members { .. } => "Members",
        };
        f.write_str(name)
    }
}

impl MembershipHandle {
    pub fn local(&self) -> &ClusterNode {
        &self.local
    }

    /// Current ring snapshot. Hold it for the whole request.
    pub fn ring(&self) -> Arc<Ring> {
        Arc::clone(&self.ring.borrow())
    }

    /// Receiver that observes every published ring.
    pub fn subscribe(&self) -> watch::Receiver<Arc<Ring>> {
        self.ring.clone()
    }

    /// Merge a peer's digest and return ours.
    pub async fn exchange(&self, records: Vec<MemberRecord>) -> ClusterResult<Vec<MemberRecord>> {
        self.request(|reply| Command::Exchange { records, reply }).await
    }

    /// Admit a joining node and return the membership it should start from.
    pub async fn join_request(&self, record: MemberRecord) -> ClusterResult<Vec<MemberRecord>> {
        self.request(|reply| Command::Join { record, reply }).await?
    }

    /// Merge records without replying.
    pub async fn merge(&self, records: Vec<MemberRecord>) -> ClusterResult<()> {
        self.commands
            .send(Command::Merge(records))
            .await
            .map_err(|_| ClusterError::Stopped)
    }

    /// Mark this node alive.
    pub async fn activate(&self) -> ClusterResult<()> {
        self.request(|reply| Command::Activate { reply }).await
    }

    /// Every known member, this node first.
    pub async fn members(&self) -> ClusterResult<Vec<MemberRecord>> {
        self.request(|reply| Command::Members { reply }).await
    }

    /// This node's own record as currently gossiped.
    pub async fn local_record(&self) -> ClusterResult<MemberRecord> {
        self.members()
            .await?
            .into_iter()
            .next()
            .ok_or(ClusterError::Stopped)
    }

    /// Wait until at least `count` nodes are in the ring.
    pub async fn wait_for_alive(&self, count: usize, timeout: Option<Duration>) -> ClusterResult<()> {
        let mut ring = self.ring.clone();
        let wait = async move { ring.wait_for(|r| r.len() >= count).await.map(|_| ()) };
        let result = match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(ClusterError::FormationTimeout {
                        expected: count,
                        alive: self.ring().len(),
                    })
                }
            },
            None => wait.await,
        };
        result.map_err(|_| ClusterError::Stopped)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> ClusterResult<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| ClusterError::Stopped)?;
        rx.await.map_err(|_| ClusterError::Stopped)
    }
}

/// The membership task.
pub struct Membership {
    table: MembershipTable,
    config: GossipConfig,
    transport: Arc<dyn GossipTransport>,
    ring: watch::Sender<Arc<Ring>>,
    commands: mpsc::Sender<Command>,
    exchanges: TaskTracker,
}

impl Membership {
    /// Start the membership task for `local`.
    ///
    /// The node starts `Joining`; call [`MembershipHandle::activate`] after
    /// seeding or joining. On cancellation the task announces itself dead to
    /// its peers and exits.
    pub fn spawn(
        local: ClusterNode,
        epoch: u64,
        config: GossipConfig,
        transport: Arc<dyn GossipTransport>,
        cancel: CancellationToken,
    ) -> (MembershipHandle, JoinHandle<()>) {
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (ring_tx, ring_rx) = watch::channel(Arc::new(Ring::empty(config.replication_factor)));

        let task = Membership {
            table: MembershipTable::new(local.clone(), epoch, config.membership.clone()),
            config,
            transport,
            ring: ring_tx,
            commands: commands_tx.clone(),
            exchanges: TaskTracker::new(),
        };
        let handle = MembershipHandle {
            local,
            commands: commands_tx,
            ring: ring_rx,
        };
        let join = tokio::spawn(task.run(commands_rx, cancel));
        (handle, join)
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.membership.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        info!(
            node = %self.table.local().node,
            epoch = self.table.local().epoch,
            "membership task started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle(command),
                _ = ticker.tick() => self.round(),
            }
        }

        self.leave().await;
        self.exchanges.close();
        self.exchanges.wait().await;
        info!(node = %self.table.local().node.name, "membership task stopped");
    }

    fn handle(&mut self, command: Command) {
        let now = Instant::now();
        match command {
            Command::Exchange { records, reply } => {
                let transitions = self.table.merge(records, now);
                let _ = reply.send(self.table.records());
                self.apply(transitions);
            }
            Command::Join { record, reply } => {
                let name = record.node.name.clone();
                match self.table.admit(record, now) {
                    Ok(transition) => {
                        info!(node = %name, "admitted joining node");
                        let _ = reply.send(Ok(self.table.records()));
                        self.apply(transition);
                    }
                    Err(e) => {
                        warn!(node = %name, error = %e, "rejected join");
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Merge(records) => {
                let transitions = self.table.merge(records, now);
                self.apply(transitions);
            }
            Command::Activate { reply } => {
                let transition = self.table.activate();
                self.apply(transition);
                let _ = reply.send(());
            }
            Command::Members { reply } => {
                let _ = reply.send(self.table.records());
            }
        }
    }

    /// One gossip round: heartbeat, detect failures, exchange with peers.
    fn round(&mut self) {
        self.table.beat();
        let transitions = self.table.tick(Instant::now());
        self.apply(transitions);

        let mut targets = self.table.gossip_targets();
        targets.shuffle(&mut rand::thread_rng());
        targets.truncate(self.config.fanout);

        for target in targets {
            let digest = self.table.records();
            let transport = Arc::clone(&self.transport);
            let commands = self.commands.clone();
            let timeout = self.config.exchange_timeout;
            self.exchanges.spawn(async move {
                let addr = target.gossip_addr.clone();
                match tokio::time::timeout(timeout, transport.exchange(&addr, digest)).await {
                    Ok(Ok(records)) => {
                        let _ = commands.send(Command::Merge(records)).await;
                    }
                    Ok(Err(e)) => debug!(peer = %target.name, error = %e, "gossip exchange failed"),
                    Err(_) => debug!(peer = %target.name, "gossip exchange timed out"),
                }
            });
        }
    }

    fn apply(&mut self, transitions: impl IntoIterator<Item = Transition>) {
        for transition in transitions {
            info!(
                node = %transition.name,
                from = ?transition.from,
                to = ?transition.to,
                "membership change"
            );
        }
        self.publish();
    }

    fn publish(&mut self) {
        let alive = self.table.alive_nodes();
        if self.ring.borrow().has_members(&alive) {
            return;
        }
        let ring = Ring::build(alive, self.config.replication_factor);
        info!(
            nodes = ring.len(),
            members = ?ring.nodes().iter().map(|n| n.name.as_str()).collect::<Vec<_>>(),
            "ring updated"
        );
        self.ring.send_replace(Arc::new(ring));
    }

    /// Tell peers this node is leaving so they drop it without waiting for
    /// failure detection.
    async fn leave(&mut self) {
        let transition = self.table.leave();
        self.apply(transition);

        let digest = self.table.records();
        let mut sends = JoinSet::new();
        for target in self.table.gossip_targets() {
            let transport = Arc::clone(&self.transport);
            let digest = digest.clone();
            sends.spawn(async move { transport.exchange(&target.gossip_addr, digest).await.map(|_| ()) });
        }
        let announced = tokio::time::timeout(self.config.leave_timeout, async {
            while sends.join_next().await.is_some() {}
        })
        .await;
        if announced.is_err() {
            debug!("leave announcement timed out");
        }
    }
}
