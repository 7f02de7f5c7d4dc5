//! Listeners for the client and cluster ports.
//!
//! Each accepted connection runs on the caller's `TaskTracker`. Cancellation
//! stops the accept loop at once and each connection at its next frame
//! boundary, so a request already being served completes and is answered.
//!
//! - Client port: TLS is terminated here when the service carries an
//!   acceptor, and the peer certificate becomes the connection's identity
//! - Cluster port: a peer request is served only if its origin is a ring
//!   member reachable at the address the connection came from

use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use rpc_cache_cluster::{serve_gossip, MembershipHandle, Ring};
use rpc_cache_protocol::{CacheError, CacheResult, RpcRequest, RpcResponse};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::codec::{read_frame, write_frame};
use super::{ClusterMessage, ClusterReply, TransportError};
use crate::auth::{tls, AuthGate, ClientIdentity};
use crate::router::RequestRouter;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on a client's TLS handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a client connection needs.
#[derive(Clone)]
pub struct ClientService {
    pub router: Arc<RequestRouter>,
    pub gate: Arc<AuthGate>,
    /// Terminates TLS on accepted connections; `None` serves plaintext
    pub tls: Option<TlsAcceptor>,
    pub max_frame: usize,
}

/// Everything a cluster connection needs.
#[derive(Clone)]
pub struct ClusterService {
    pub router: Arc<RequestRouter>,
    pub membership: MembershipHandle,
    pub max_frame: usize,
}

/// Accept client connections until `cancel` fires.
pub async fn serve_clients(
    listener: TcpListener,
    service: ClientService,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let conn_cancel = cancel.clone();
    accept_loop(listener, cancel, tracker, "client", move |stream, _peer| {
        let service = service.clone();
        let cancel = conn_cancel.clone();
        async move {
            let Some(acceptor) = service.tls.clone() else {
                return serve_client_connection(stream, None, service, cancel).await;
            };
            let stream = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(stream))
                .await
                .map_err(|_| TransportError::ConnectionTimeout)??;
            let identity = tls::peer_identity(&stream);
            debug!(identity = ?identity.as_ref().map(ClientIdentity::fingerprint), "tls handshake complete");
            serve_client_connection(stream, identity, service, cancel).await
        }
    })
    .await;
}

/// Accept cluster connections (gossip and peer requests) until `cancel` fires.
pub async fn serve_cluster(
    listener: TcpListener,
    service: ClusterService,
    cancel: CancellationToken,
    tracker: TaskTracker,
) {
    let conn_cancel = cancel.clone();
    accept_loop(listener, cancel, tracker, "cluster", move |stream, peer| {
        serve_cluster_connection(stream, peer.ip(), service.clone(), conn_cancel.clone())
    })
    .await;
}

async fn accept_loop<H, Fut>(
    listener: TcpListener,
    cancel: CancellationToken,
    tracker: TaskTracker,
    role: &'static str,
    handler: H,
) where
    H: Fn(TcpStream, SocketAddr) -> Fut,
    Fut: Future<Output = Result<(), TransportError>> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        info!(role, addr = %addr, "listening");
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(role, "accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                    continue;
                }
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(role, peer = %peer, "set_nodelay failed: {}", e);
        }

        let connection = handler(stream, peer);
        tracker.spawn(async move {
            if let Err(e) = connection.await {
                debug!(role, peer = %peer, "connection closed: {}", e);
            }
        });
    }

    info!(role, "listener stopped");
}

/// Serve one client connection.
///
/// `identity` is the certificate the peer presented during the TLS
/// handshake; plaintext connections pass `None`.
pub async fn serve_client_connection<S>(
    stream: S,
    identity: Option<ClientIdentity>,
    service: ClientService,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);
    let capability = service.gate.authorize(identity.as_ref());

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame::<_, RpcRequest>(&mut reader, service.max_frame) => frame,
        };

        let response = match frame {
            Ok(None) => break,
            Ok(Some(request)) => match &capability {
                Ok(capability) => service.router.handle(*capability, request).await,
                Err(e) => RpcResponse::error(request.request_id, e.clone()),
            },
            Err(TransportError::Serialization(e)) => {
                RpcResponse::error("", CacheError::invalid_request(format!("malformed request: {}", e)))
            }
            Err(e) => return Err(e),
        };
        write_frame(&mut write, &response).await?;
    }
    Ok(())
}

async fn serve_cluster_connection<S>(
    stream: S,
    remote: IpAddr,
    service: ClusterService,
    cancel: CancellationToken,
) -> Result<(), TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = read_frame::<_, ClusterMessage>(&mut reader, service.max_frame) => frame,
        };
        let Some(message) = frame? else {
            break;
        };

        let reply = match message {
            ClusterMessage::Gossip { request } => ClusterReply::Gossip {
                response: serve_gossip(&service.membership, request).await,
            },
            ClusterMessage::Peer { request } => {
                let request_id = request.request_id.clone();
                let result = match verify_peer_address(&service.router.ring(), &request.origin, remote).await {
                    Ok(()) => service.router.handle_peer(request).await,
                    Err(e) => {
                        warn!(origin = %request.origin, remote = %remote, "rejected peer request: {}", e.message);
                        Err(e)
                    }
                };
                ClusterReply::Peer {
                    response: RpcResponse::from_result(request_id, result),
                }
            }
        };
        write_frame(&mut write, &reply).await?;
    }
    Ok(())
}

/// Check that a peer request naming `origin` came from an address that
/// `origin` advertises in the ring.
pub async fn verify_peer_address(ring: &Ring, origin: &str, remote: IpAddr) -> CacheResult<()> {
    let advertised = ring
        .node(origin)
        .map(|node| node.rpc_addr.clone())
        .ok_or_else(|| CacheError::unauthenticated(format!("{} is not a member of this cluster", origin)))?;

    let resolved = tokio::net::lookup_host(advertised.as_str())
        .await
        .map_err(|e| CacheError::unauthenticated(format!("cannot resolve {} for {}: {}", advertised, origin, e)))?;
    let remote = remote.to_canonical();
    for addr in resolved {
        if addr.ip().to_canonical() == remote {
            return Ok(());
        }
    }
    Err(CacheError::unauthenticated(format!(
        "request for {} came from {}, not {}",
        origin, remote, advertised
    )))
}
