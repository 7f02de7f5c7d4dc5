//! TLS material and rustls configuration
//!
//! - Server: certificate chain and key from PEM files. Client certificates
//!   are requested whenever trust sets are configured, and checked against
//!   the CA when one is given
//! - Client: roots from a CA file plus an optional client certificate
//!
//! A handshake never fails just because a client presents no certificate or
//! an untrusted one; the [`AuthGate`](super::AuthGate) answers such clients
//! with `UNAUTHENTICATED` on every request.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::WebPkiClientVerifier;
use rustls::{DigitallySignedStruct, DistinguishedName, RootCertStore, SignatureScheme};
use tokio_rustls::{server, TlsAcceptor, TlsConnector};
use tracing::info;

use super::{AuthError, ClientIdentity};
use crate::config::{ConfigError, TlsConfig};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn tls_error(context: &str) -> impl FnOnce(rustls::Error) -> ConfigError + '_ {
    move |e| ConfigError::ValidationError(format!("{}: {}", context, e))
}

/// Read every certificate in a PEM file, in order.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, AuthError> {
    let file = File::open(path).map_err(|source| AuthError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| AuthError::Pem {
            path: path.to_path_buf(),
            source,
        })
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) in a PEM file.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, AuthError> {
    let file = File::open(path).map_err(|source| AuthError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|source| AuthError::Pem {
            path: path.to_path_buf(),
            source,
        })?
        .ok_or_else(|| AuthError::NoPrivateKey {
            path: path.to_path_buf(),
        })
}

fn load_roots(path: &Path) -> Result<RootCertStore, ConfigError> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|e| ConfigError::ParseError(format!("CA certificate in {}: {}", path.display(), e)))?;
    }
    if roots.is_empty() {
        return Err(AuthError::Empty {
            path: path.to_path_buf(),
        }
        .into());
    }
    Ok(roots)
}

/// TLS acceptor for the client port, or `None` without a server key pair.
pub fn server_acceptor(tls: &TlsConfig) -> Result<Option<TlsAcceptor>, ConfigError> {
    tls.validate()?;
    let (Some(key_file), Some(cert_file)) = (&tls.key_file, &tls.cert_file) else {
        return Ok(None);
    };
    let chain = load_certs(cert_file)?;
    if chain.is_empty() {
        return Err(AuthError::Empty {
            path: cert_file.clone(),
        }
        .into());
    }
    let key = load_private_key(key_file)?;

    let provider = provider();
    let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(tls_error("TLS protocol versions"))?;
    let builder = if tls.has_trust_sets() {
        let verifier: Arc<dyn ClientCertVerifier> = match &tls.ca_cert_file {
            Some(ca) => WebPkiClientVerifier::builder_with_provider(Arc::new(load_roots(ca)?), Arc::clone(&provider))
                .allow_unauthenticated()
                .build()
                .map_err(|e| ConfigError::ValidationError(format!("client certificate verifier: {}", e)))?,
            None => Arc::new(AnyClientCert::new(&provider)),
        };
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };
    let config = builder
        .with_single_cert(chain, key)
        .map_err(tls_error("server certificate"))?;

    info!(
        client_certs = tls.has_trust_sets(),
        ca = tls.ca_cert_file.is_some(),
        "client port uses TLS"
    );
    Ok(Some(TlsAcceptor::from(Arc::new(config))))
}

/// TLS connector for a build client trusting `ca_file`.
///
/// `identity` is the client's `(certificate, key)` PEM files.
pub fn client_connector(ca_file: &Path, identity: Option<(&Path, &Path)>) -> Result<TlsConnector, ConfigError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()
        .map_err(tls_error("TLS protocol versions"))?
        .with_root_certificates(load_roots(ca_file)?);
    let config = match identity {
        Some((cert_file, key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
            .map_err(tls_error("client certificate"))?,
        None => builder.with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Identity of the certificate a client presented, if any.
pub fn peer_identity<IO>(stream: &server::TlsStream<IO>) -> Option<ClientIdentity> {
    let (_, connection) = stream.get_ref();
    connection
        .peer_certificates()
        .and_then(|certs| certs.first())
        .map(|cert| ClientIdentity::from_der(cert.as_ref()))
}

/// Accepts any client certificate that proves possession of its key; the
/// trust sets decide what it may do.
#[derive(Debug)]
struct AnyClientCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AnyClientCert {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            algorithms: provider.signature_verification_algorithms,
        }
    }
}

impl ClientCertVerifier for AnyClientCert {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::CertifiedKey;
    use std::fs;
    use tempfile::TempDir;

    fn self_signed(dir: &TempDir) -> (std::path::PathBuf, std::path::PathBuf) {
        let CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let cert_file = dir.path().join("server.crt");
        let key_file = dir.path().join("server.key");
        fs::write(&cert_file, cert.pem()).unwrap();
        fs::write(&key_file, key_pair.serialize_pem()).unwrap();
        (cert_file, key_file)
    }

    #[test]
    fn test_no_key_pair_is_plaintext() {
        assert!(server_acceptor(&TlsConfig::default()).unwrap().is_none());
    }

    #[test]
    fn test_acceptor_with_and_without_client_certs() {
        let dir = TempDir::new().unwrap();
        let (cert_file, key_file) = self_signed(&dir);
        let mut tls = TlsConfig {
            key_file: Some(key_file),
            cert_file: Some(cert_file.clone()),
            ..Default::default()
        };
        assert!(server_acceptor(&tls).unwrap().is_some());

        tls.writable_certs = Some(cert_file.clone());
        assert!(server_acceptor(&tls).unwrap().is_some());

        tls.ca_cert_file = Some(cert_file);
        assert!(server_acceptor(&tls).unwrap().is_some());
    }

    #[test]
    fn test_key_file_without_key_is_parse_error() {
        let dir = TempDir::new().unwrap();
        let (cert_file, _) = self_signed(&dir);
        let tls = TlsConfig {
            key_file: Some(cert_file.clone()),
            cert_file: Some(cert_file),
            ..Default::default()
        };
        let err = server_acceptor(&tls).err().expect("expected error");
        assert!(matches!(err, ConfigError::ParseError(_)), "got {:?}", err);
    }

    #[test]
    fn test_missing_server_cert_is_io_error() {
        let dir = TempDir::new().unwrap();
        let tls = TlsConfig {
            key_file: Some(dir.path().join("server.key")),
            cert_file: Some(dir.path().join("server.crt")),
            ..Default::default()
        };
        let err = server_acceptor(&tls).err().expect("expected error");
        assert!(matches!(err, ConfigError::IoError(_)), "got {:?}", err);
    }

    #[test]
    fn test_load_certs_keeps_file_order() {
        let dir = TempDir::new().unwrap();
        let first = rcgen::generate_simple_self_signed(vec!["first".to_string()]).unwrap().cert;
        let second = rcgen::generate_simple_self_signed(vec!["second".to_string()]).unwrap().cert;
        let path = dir.path().join("bundle.pem");
        fs::write(&path, format!("{}{}", first.pem(), second.pem())).unwrap();

        let certs = load_certs(&path).unwrap();
        assert_eq!(certs, vec![first.der().clone(), second.der().clone()]);
    }
}
