//! End-to-end tests over TCP
//!
//! - A standalone server serving a build client
//! - Mutual TLS with writable, read-only and unknown client certificates
//! - A two-node cluster formed by seeding and joining, and its cluster port
//!   turning away requests from outside the ring

mod fixtures;

use std::net::TcpListener as StdTcpListener;
use std::path::{Path, PathBuf};

use fixtures::eventually;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rpc_cache_protocol::ops::Operation;
use rpc_cache_protocol::{ArtifactKey, ErrorCode, PeerMode, PeerRequest, RpcResponse};
use rpc_cache_server::auth::tls;
use rpc_cache_server::config::{HumanDuration, TlsConfig};
use rpc_cache_server::transport::{ClusterMessage, ClusterReply};
use rpc_cache_server::{CacheClient, CacheServer, ServerConfig};
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

fn local_config(dir: &TempDir, name: &str) -> ServerConfig {
    let mut config = ServerConfig {
        port: 0,
        bind: "127.0.0.1".to_string(),
        dir: dir.path().join(name),
        ..Default::default()
    };
    config.cluster.node_name = Some(name.to_string());
    config
}

fn free_port() -> u16 {
    let listener = StdTcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Seed `a` and join `b` to it; both see each other when this returns.
async fn start_pair(dir: &TempDir) -> (CacheServer, CacheServer) {
    let seed_port = free_port();

    let mut seed = local_config(dir, "a");
    seed.cluster.seed_cluster = true;
    seed.cluster.cluster_size = 2;
    seed.cluster.cluster_port = seed_port;
    seed.cluster.replication_factor = 1;
    seed.cluster.gossip_interval = HumanDuration(std::time::Duration::from_millis(50));

    let mut joiner = local_config(dir, "b");
    joiner.cluster.cluster_port = 0;
    joiner.cluster.cluster_addresses = vec![format!("127.0.0.1:{}", seed_port)];
    joiner.cluster.replication_factor = 1;
    joiner.cluster.gossip_interval = seed.cluster.gossip_interval;

    // Seeding blocks until the second node is alive.
    let seeding = tokio::spawn(CacheServer::start(seed));
    let b = CacheServer::start(joiner).await.unwrap();
    let a = seeding.await.unwrap().unwrap();

    eventually("a sees both nodes", || a.router().ring().len() == 2).await;
    eventually("b sees both nodes", || b.router().ring().len() == 2).await;
    (a, b)
}

/// Certificate and key PEM files on disk.
struct IssuedCert {
    cert: PathBuf,
    key: PathBuf,
}

/// A throwaway CA issuing server and client certificates.
struct TestPki {
    dir: PathBuf,
    ca: Certificate,
    ca_key: KeyPair,
    ca_file: PathBuf,
}

impl TestPki {
    fn new(dir: &Path) -> Self {
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::DigitalSignature];
        params.distinguished_name.push(DnType::CommonName, "rpc cache test ca");
        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();
        let ca_file = dir.join("ca.pem");
        std::fs::write(&ca_file, ca.pem()).unwrap();
        Self {
            dir: dir.to_path_buf(),
            ca,
            ca_key,
            ca_file,
        }
    }

    fn issue(&self, name: &str, sans: &[&str], usage: ExtendedKeyUsagePurpose) -> IssuedCert {
        let sans: Vec<String> = sans.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(sans).unwrap();
        params.distinguished_name.push(DnType::CommonName, name);
        params.extended_key_usages = vec![usage];
        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();

        let issued = IssuedCert {
            cert: self.dir.join(format!("{}.crt", name)),
            key: self.dir.join(format!("{}.key", name)),
        };
        std::fs::write(&issued.cert, cert.pem()).unwrap();
        std::fs::write(&issued.key, key.serialize_pem()).unwrap();
        issued
    }

    async fn client(&self, server: &CacheServer, identity: Option<&IssuedCert>) -> CacheClient {
        let identity = identity.map(|i| (i.cert.as_path(), i.key.as_path()));
        let connector = tls::client_connector(&self.ca_file, identity).unwrap();
        CacheClient::connect_tls(server.client_addr(), "localhost", &connector)
            .await
            .unwrap()
    }
}

#[tokio::test]
async fn test_standalone_round_trip() {
    let dir = TempDir::new().unwrap();
    let server = CacheServer::start(local_config(&dir, "solo")).await.unwrap();
    assert!(server.cluster_addr().is_none());

    let key = ArtifactKey::parse("src/core/core.a").unwrap();
    let mut client = CacheClient::connect(server.client_addr()).await.unwrap();

    let stored = client.store(&key, b"archive bytes".to_vec()).await.unwrap();
    assert!(stored.ok, "{:?}", stored.error);

    let fetched = client.retrieve(&key).await.unwrap();
    assert_eq!(fetched.payload.unwrap(), b"archive bytes");

    let status = server.status().await;
    assert_eq!(status.node, "solo");
    assert_eq!(status.artifact_count, 1);
    assert!(status.total_size >= b"archive bytes".len() as u64);
    assert_eq!(status.members.len(), 1);

    assert!(client.delete(&key).await.unwrap().ok);
    let missing = client.retrieve(&key).await.unwrap();
    assert_eq!(missing.error.unwrap().code, ErrorCode::NotFound);
    // Deleting again is still a success.
    assert!(client.delete(&key).await.unwrap().ok);

    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_malformed_frame_gets_invalid_request() {
    let dir = TempDir::new().unwrap();
    let server = CacheServer::start(local_config(&dir, "solo")).await.unwrap();

    let stream = TcpStream::connect(server.client_addr()).await.unwrap();
    let (read, mut write) = stream.into_split();
    write.write_all(b"{not json\n").await.unwrap();

    let mut line = String::new();
    BufReader::new(read).read_line(&mut line).await.unwrap();
    let response: RpcResponse = serde_json::from_str(line.trim_end()).unwrap();
    assert!(!response.ok);
    assert_eq!(response.error.unwrap().code, ErrorCode::InvalidRequest);

    drop(write);
    server.shutdown().await;
}

#[tokio::test]
async fn test_artifacts_survive_restart() {
    let dir = TempDir::new().unwrap();
    let key = ArtifactKey::parse("src/core/persisted").unwrap();

    let server = CacheServer::start(local_config(&dir, "solo")).await.unwrap();
    let mut client = CacheClient::connect(server.client_addr()).await.unwrap();
    assert!(client.store(&key, b"kept".to_vec()).await.unwrap().ok);
    drop(client);
    server.shutdown().await;

    let server = CacheServer::start(local_config(&dir, "solo")).await.unwrap();
    assert_eq!(server.status().await.artifact_count, 1);
    let mut client = CacheClient::connect(server.client_addr()).await.unwrap();
    assert_eq!(client.retrieve(&key).await.unwrap().payload.unwrap(), b"kept");
    drop(client);
    server.shutdown().await;
}

#[tokio::test]
async fn test_tls_clients_get_their_capability() {
    let dir = TempDir::new().unwrap();
    let pki = TestPki::new(dir.path());
    let server_cert = pki.issue("server", &["localhost"], ExtendedKeyUsagePurpose::ServerAuth);
    let writer = pki.issue("writer", &[], ExtendedKeyUsagePurpose::ClientAuth);
    let reader = pki.issue("reader", &[], ExtendedKeyUsagePurpose::ClientAuth);
    let stranger = pki.issue("stranger", &[], ExtendedKeyUsagePurpose::ClientAuth);

    let mut config = local_config(&dir, "secure");
    config.tls = TlsConfig {
        key_file: Some(server_cert.key.clone()),
        cert_file: Some(server_cert.cert.clone()),
        ca_cert_file: Some(pki.ca_file.clone()),
        writable_certs: Some(writer.cert.clone()),
        readonly_certs: Some(reader.cert.clone()),
    };
    let server = CacheServer::start(config).await.unwrap();
    let key = ArtifactKey::parse("src/secure/lib.a").unwrap();

    let mut writing = pki.client(&server, Some(&writer)).await;
    let stored = writing.store(&key, b"signed build".to_vec()).await.unwrap();
    assert!(stored.ok, "{:?}", stored.error);

    let mut reading = pki.client(&server, Some(&reader)).await;
    assert_eq!(reading.retrieve(&key).await.unwrap().payload.unwrap(), b"signed build");
    for denied in [
        reading.store(&key, b"tampered".to_vec()).await.unwrap(),
        reading.delete(&key).await.unwrap(),
    ] {
        assert_eq!(denied.error.unwrap().code, ErrorCode::PermissionDenied);
    }

    let mut unknown = pki.client(&server, Some(&stranger)).await;
    let rejected = unknown.retrieve(&key).await.unwrap();
    assert_eq!(rejected.error.unwrap().code, ErrorCode::Unauthenticated);

    let mut anonymous = pki.client(&server, None).await;
    let rejected = anonymous.store(&key, b"anon".to_vec()).await.unwrap();
    assert_eq!(rejected.error.unwrap().code, ErrorCode::Unauthenticated);

    // The TLS port does not speak plaintext.
    let mut plain = CacheClient::connect(server.client_addr()).await.unwrap();
    assert!(plain.retrieve(&key).await.is_err());

    assert_eq!(writing.retrieve(&key).await.unwrap().payload.unwrap(), b"signed build");
    drop((writing, reading, unknown, anonymous, plain));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_node_cluster_serves_from_either_node() {
    let dir = TempDir::new().unwrap();
    let (a, b) = start_pair(&dir).await;

    let mut client_a = CacheClient::connect(a.client_addr()).await.unwrap();
    let mut client_b = CacheClient::connect(b.client_addr()).await.unwrap();
    for i in 0..8 {
        let key = ArtifactKey::parse(format!("pkg/two-node/{}", i)).unwrap();
        let payload = format!("payload {}", i).into_bytes();
        let stored = client_a.store(&key, payload.clone()).await.unwrap();
        assert!(stored.ok, "{:?}", stored.error);

        let fetched = client_b.retrieve(&key).await.unwrap();
        assert_eq!(fetched.payload.unwrap(), payload);
    }

    let status = a.status().await;
    assert_eq!(status.members.len(), 2);
    assert!(status.cluster_addr.is_some());

    drop(client_a);
    drop(client_b);
    b.shutdown().await;
    a.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_cluster_port_rejects_outside_peer_writes() {
    let dir = TempDir::new().unwrap();
    let (a, b) = start_pair(&dir).await;
    let key = ArtifactKey::parse("pkg/evil/1").unwrap();

    let stream = TcpStream::connect(a.cluster_addr().unwrap()).await.unwrap();
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    for op in [Operation::Store, Operation::Delete] {
        let message = ClusterMessage::Peer {
            request: PeerRequest {
                request_id: format!("outside-{}", op.as_str()),
                op,
                key: key.clone(),
                payload: (op == Operation::Store).then(|| b"planted".to_vec()),
                mode: PeerMode::Forward,
                budget_ms: 1000,
                origin: "attacker".to_string(),
            },
        };
        let mut line = serde_json::to_vec(&message).unwrap();
        line.push(b'\n');
        write.write_all(&line).await.unwrap();

        let mut reply = String::new();
        reader.read_line(&mut reply).await.unwrap();
        let ClusterReply::Peer { response } = serde_json::from_str(reply.trim_end()).unwrap() else {
            panic!("expected a peer reply, got {}", reply);
        };
        assert!(!response.ok);
        assert_eq!(response.error.unwrap().code, ErrorCode::Unauthenticated);
    }

    assert!(!a.router().store_handle().contains(&key));
    assert!(!b.router().store_handle().contains(&key));

    drop(write);
    b.shutdown().await;
    a.shutdown().await;
}
