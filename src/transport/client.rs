//! Outbound side of the transport.
//!
//! - [`TcpPeerClient`]: peer requests to other nodes' cluster ports
//! - [`TcpGossipTransport`]: gossip exchanges over the same port
//! - [`CacheClient`]: a build client talking to the client port

use std::time::Duration;

use async_trait::async_trait;
use rpc_cache_cluster::{ClusterError, ClusterNode, ClusterResult, GossipRequest, GossipResponse, GossipTransport};
use rpc_cache_protocol::ops::Operation;
use rpc_cache_protocol::{ArtifactKey, PeerRequest, RpcRequest, RpcResponse};
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio_rustls::TlsConnector;

use super::codec::{read_frame, write_frame, MAX_FRAME_BYTES};
use super::{ClusterMessage, ClusterReply, TransportError};
use crate::router::{PeerClient, PeerError};

/// Default connect timeout for cluster connections
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

async fn connect(addr: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => {
            stream.set_nodelay(true)?;
            Ok(stream)
        }
        Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!("{}: {}", addr, e))),
        Err(_) => Err(TransportError::ConnectionTimeout),
    }
}

/// Send one frame on a fresh connection and read the reply.
async fn round_trip<Req, Resp>(
    addr: &str,
    connect_timeout: Duration,
    max_frame: usize,
    request: &Req,
) -> Result<Resp, TransportError>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let stream = connect(addr, connect_timeout).await?;
    let (read, mut write) = stream.into_split();
    write_frame(&mut write, request).await?;
    let mut reader = BufReader::new(read);
    read_frame(&mut reader, max_frame)
        .await?
        .ok_or_else(|| TransportError::Protocol("connection closed before reply".to_string()))
}

/// Peer requests over TCP, one connection per request.
#[derive(Debug, Clone)]
pub struct TcpPeerClient {
    connect_timeout: Duration,
    max_frame: usize,
}

impl TcpPeerClient {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            max_frame: MAX_FRAME_BYTES,
        }
    }
}

impl Default for TcpPeerClient {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl PeerClient for TcpPeerClient {
    async fn call(&self, node: &ClusterNode, request: PeerRequest) -> Result<Option<Vec<u8>>, PeerError> {
        let message = ClusterMessage::Peer { request };
        let reply: ClusterReply = round_trip(&node.rpc_addr, self.connect_timeout, self.max_frame, &message)
            .await
            .map_err(|e| PeerError::unreachable(node, e))?;
        match reply {
            ClusterReply::Peer { response } => response.into_result().map_err(PeerError::Remote),
            ClusterReply::Gossip { .. } => Err(PeerError::unreachable(node, "gossip reply to a peer request")),
        }
    }
}

/// Gossip over TCP, bounded by a per-exchange timeout.
#[derive(Debug, Clone)]
pub struct TcpGossipTransport {
    timeout: Duration,
    max_frame: usize,
}

impl TcpGossipTransport {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            max_frame: MAX_FRAME_BYTES,
        }
    }
}

#[async_trait]
impl GossipTransport for TcpGossipTransport {
    async fn send(&self, addr: &str, request: GossipRequest) -> ClusterResult<GossipResponse> {
        let message = ClusterMessage::Gossip { request };
        let exchange = round_trip::<_, ClusterReply>(addr, self.timeout, self.max_frame, &message);
        let reply = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => return Err(ClusterError::unreachable(addr, e)),
            Err(_) => return Err(ClusterError::unreachable(addr, TransportError::ConnectionTimeout)),
        };
        match reply {
            ClusterReply::Gossip { response } => Ok(response),
            ClusterReply::Peer { .. } => Err(ClusterError::unreachable(addr, "peer reply to a gossip request")),
        }
    }
}

/// A build client connection to the client port.
pub struct CacheClient {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    max_frame: usize,
}

impl std::fmt::Debug for CacheClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheClient").field("max_frame", &self.max_frame).finish()
    }
}

async fn connect_client(addr: impl ToSocketAddrs) -> Result<TcpStream, TransportError> {
    let stream = TcpStream::connect(addr)
        .await
        .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

impl CacheClient {
    /// Plaintext connection.
    pub async fn connect(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Ok(Self::from_stream(connect_client(addr).await?))
    }

    /// TLS connection, verifying the server certificate against `server_name`.
    pub async fn connect_tls(
        addr: impl ToSocketAddrs,
        server_name: &str,
        connector: &TlsConnector,
    ) -> Result<Self, TransportError> {
        let name = ServerName::try_from(server_name.to_string())
            .map_err(|e| TransportError::ConnectionFailed(format!("invalid server name {}: {}", server_name, e)))?;
        let stream = connect_client(addr).await?;
        let stream = connector
            .connect(name, stream)
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("TLS handshake: {}", e)))?;
        Ok(Self::from_stream(stream))
    }

    fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (read, write) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(Box::new(read)),
            writer: Box::new(write),
            max_frame: MAX_FRAME_BYTES,
        }
    }

    /// Send a request and wait for its response.
    pub async fn call(&mut self, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        write_frame(&mut self.writer, request).await?;
        let response: RpcResponse = read_frame(&mut self.reader, self.max_frame)
            .await?
            .ok_or_else(|| TransportError::Protocol("server closed the connection".to_string()))?;
        if response.request_id != request.request_id {
            return Err(TransportError::Protocol(format!(
                "response for {} while waiting for {}",
                response.request_id, request.request_id
            )));
        }
        Ok(response)
    }

    pub async fn store(&mut self, key: &ArtifactKey, payload: Vec<u8>) -> Result<RpcResponse, TransportError> {
        let request = RpcRequest::new(Operation::Store, next_request_id(), key.clone()).with_payload(payload);
        self.call(&request).await
    }

    pub async fn retrieve(&mut self, key: &ArtifactKey) -> Result<RpcResponse, TransportError> {
        let request = RpcRequest::new(Operation::Retrieve, next_request_id(), key.clone());
        self.call(&request).await
    }

    pub async fn delete(&mut self, key: &ArtifactKey) -> Result<RpcResponse, TransportError> {
        let request = RpcRequest::new(Operation::Delete, next_request_id(), key.clone());
        self.call(&request).await
    }
}

fn next_request_id() -> String {
    ulid::Ulid::new().to_string()
}
