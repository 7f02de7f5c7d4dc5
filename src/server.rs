//! Server composition
//!
//! [`CacheServer::start`] wires the components together from one
//! [`ServerConfig`]:
//! 1. Validate config, load trust sets and TLS material, open the store
//!    (startup scan)
//! 2. Standalone: a fixed single-node ring. Clustered: bind the cluster
//!    port, start the membership task, then seed or join
//! 3. Start the evictor, the repair task and the client listener
//!
//! [`CacheServer::shutdown`] stops accepting, drains in-flight requests and
//! replication, then stops the background tasks; the membership task
//! announces its departure on the way out.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use rpc_cache_cluster::{
    join_cluster, seed_cluster, startup_epoch, BootstrapPlan, ClusterError, ClusterNode, GossipTransport, Membership,
    MembershipHandle, NodeState, Resolver, SystemResolver,
};
use rpc_cache_store::{ArtifactStore, Evictor, StoreError};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::auth::{tls, AuthGate};
use crate::config::{ConfigError, ServerConfig};
use crate::router::{spawn_repair, standalone_ring, RequestRouter, RouterConfig};
use crate::transport::{
    serve_clients, serve_cluster, ClientService, ClusterService, TcpGossipTransport, TcpPeerClient, MAX_FRAME_BYTES,
};

/// Errors starting the server
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("cannot open artifact store: {0}")]
    Store(#[from] StoreError),

    #[error("cluster bootstrap failed: {0}")]
    Cluster(#[from] ClusterError),

    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
}

/// Snapshot for status and metrics reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    pub node: String,
    pub client_addr: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_addr: Option<SocketAddr>,
    pub total_size: u64,
    pub artifact_count: u64,
    pub repair_backlog: usize,
    pub members: Vec<MemberStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatus {
    pub name: String,
    pub addr: String,
    pub state: NodeState,
}

struct ClusterRuntime {
    handle: MembershipHandle,
    task: JoinHandle<()>,
    addr: SocketAddr,
}

/// A running cache server.
pub struct CacheServer {
    router: Arc<RequestRouter>,
    store: Arc<ArtifactStore>,
    cluster: Option<ClusterRuntime>,
    client_addr: SocketAddr,
    /// Stops the listeners and connection loops
    listeners_cancel: CancellationToken,
    /// Stops the evictor, repair and membership tasks
    background_cancel: CancellationToken,
    connections: TaskTracker,
    listeners: Vec<JoinHandle<()>>,
    background: Vec<JoinHandle<()>>,
}

async fn bind(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = format!("{}:{}", host, port);
    TcpListener::bind(&addr)
        .await
        .map_err(|source| ServerError::Bind { addr, source })
}

impl CacheServer {
    /// Start a server, resolving cluster addresses through DNS.
    pub async fn start(config: ServerConfig) -> Result<Self, ServerError> {
        Self::start_with(config, &SystemResolver).await
    }

    pub async fn start_with(config: ServerConfig, resolver: &dyn Resolver) -> Result<Self, ServerError> {
        config.validate()?;
        let gate = Arc::new(AuthGate::from_config(&config.tls)?);
        let acceptor = tls::server_acceptor(&config.tls)?;
        let store = Arc::new(ArtifactStore::open(config.store_config())?);
        let background_cancel = CancellationToken::new();
        let listeners_cancel = CancellationToken::new();
        let connections = TaskTracker::new();

        let client_listener = bind(&config.bind, config.port).await?;
        let client_addr = client_listener
            .local_addr()
            .map_err(|source| ServerError::Bind {
                addr: format!("{}:{}", config.bind, config.port),
                source,
            })?;

        let router_config = RouterConfig {
            forward_writes: config.cluster.forward_writes,
            request_timeout: config.request_timeout(),
        };

        let plan = if config.is_clustered() {
            BootstrapPlan::resolve(&config.bootstrap_config(), resolver).map_err(|e| match e {
                ClusterError::InvalidBootstrap(reason) => ServerError::Config(ConfigError::ValidationError(reason)),
                other => ServerError::Cluster(other),
            })?
        } else {
            BootstrapPlan::Standalone
        };

        let mut listeners = Vec::new();
        let (router, cluster) = match plan {
            BootstrapPlan::Standalone => {
                let local = ClusterNode::new(config.node_name(), client_addr.to_string(), client_addr.to_string());
                info!(node = %local.name, "running standalone");
                let ring = standalone_ring(&local);
                let router = RequestRouter::new(
                    local,
                    Arc::clone(&store),
                    ring,
                    Arc::new(TcpPeerClient::default()),
                    router_config,
                );
                (Arc::new(router), None)
            }
            plan => {
                let cluster_listener = bind(&config.bind, config.cluster.cluster_port).await?;
                let cluster_addr = cluster_listener.local_addr().map_err(|source| ServerError::Bind {
                    addr: format!("{}:{}", config.bind, config.cluster.cluster_port),
                    source,
                })?;
                let advertised = format!("{}:{}", config.advertise_host(), cluster_addr.port());
                let local = ClusterNode::new(config.node_name(), advertised.clone(), advertised);

                let gossip_config = config.gossip_config();
                let transport = Arc::new(TcpGossipTransport::new(gossip_config.exchange_timeout));
                let (handle, task) = Membership::spawn(
                    local.clone(),
                    startup_epoch(),
                    gossip_config,
                    Arc::clone(&transport) as Arc<dyn GossipTransport>,
                    background_cancel.clone(),
                );

                let router = Arc::new(RequestRouter::new(
                    local,
                    Arc::clone(&store),
                    handle.subscribe(),
                    Arc::new(TcpPeerClient::default()),
                    router_config,
                ));

                let service = ClusterService {
                    router: Arc::clone(&router),
                    membership: handle.clone(),
                    max_frame: MAX_FRAME_BYTES,
                };
                listeners.push(tokio::spawn(serve_cluster(
                    cluster_listener,
                    service,
                    listeners_cancel.clone(),
                    connections.clone(),
                )));

                let bootstrap = match plan {
                    BootstrapPlan::Seed { cluster_size } => seed_cluster(&handle, cluster_size, None).await,
                    BootstrapPlan::Join { addrs } => {
                        join_cluster(&handle, transport.as_ref(), &addrs, &config.join_retry()).await
                    }
                    BootstrapPlan::Standalone => Ok(()),
                };
                if let Err(e) = bootstrap {
                    listeners_cancel.cancel();
                    background_cancel.cancel();
                    return Err(e.into());
                }

                let runtime = ClusterRuntime {
                    handle,
                    task,
                    addr: cluster_addr,
                };
                (router, Some(runtime))
            }
        };

        let background = vec![
            Evictor::new(Arc::clone(&store), config.eviction_policy()).spawn(background_cancel.clone()),
            spawn_repair(
                Arc::clone(&router),
                config.cluster.repair_interval.get(),
                background_cancel.clone(),
            ),
        ];

        let service = ClientService {
            router: Arc::clone(&router),
            gate,
            tls: acceptor,
            max_frame: MAX_FRAME_BYTES,
        };
        listeners.push(tokio::spawn(serve_clients(
            client_listener,
            service,
            listeners_cancel.clone(),
            connections.clone(),
        )));

        info!(
            node = %router.local().name,
            client_addr = %client_addr,
            dir = %config.dir.display(),
            "cache server started"
        );

        Ok(Self {
            router,
            store,
            cluster,
            client_addr,
            listeners_cancel,
            background_cancel,
            connections,
            listeners,
            background,
        })
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client_addr
    }

    pub fn cluster_addr(&self) -> Option<SocketAddr> {
        self.cluster.as_ref().map(|c| c.addr)
    }

    pub fn router(&self) -> &Arc<RequestRouter> {
        &self.router
    }

    pub fn membership(&self) -> Option<&MembershipHandle> {
        self.cluster.as_ref().map(|c| &c.handle)
    }

    /// Aggregate size, artifact count and member states.
    pub async fn status(&self) -> ServerStatus {
        let stats = self.store.stat();
        let members = match &self.cluster {
            Some(cluster) => match cluster.handle.members().await {
                Ok(records) => records
                    .into_iter()
                    .map(|r| MemberStatus {
                        name: r.node.name,
                        addr: r.node.gossip_addr,
                        state: r.state,
                    })
                    .collect(),
                Err(e) => {
                    warn!("membership unavailable for status: {}", e);
                    Vec::new()
                }
            },
            None => vec![MemberStatus {
                name: self.router.local().name.clone(),
                addr: self.client_addr.to_string(),
                state: NodeState::Alive,
            }],
        };

        ServerStatus {
            node: self.router.local().name.clone(),
            client_addr: self.client_addr,
            cluster_addr: self.cluster_addr(),
            total_size: stats.total_size,
            artifact_count: stats.artifact_count,
            repair_backlog: self.router.repair_queue().len(),
            members,
        }
    }

    /// Stop accepting, drain in-flight work and stop background tasks.
    pub async fn shutdown(self) {
        info!("shutting down: no longer accepting connections");
        self.listeners_cancel.cancel();
        for listener in self.listeners {
            if let Err(e) = listener.await {
                error!("listener task failed: {}", e);
            }
        }

        self.connections.close();
        self.connections.wait().await;
        self.router.drain().await;

        self.background_cancel.cancel();
        let membership = self.cluster.map(|c| c.task);
        for task in self.background.into_iter().chain(membership) {
            if let Err(e) = task.await {
                error!("background task failed: {}", e);
            }
        }
        info!("shutdown complete");
    }
}
