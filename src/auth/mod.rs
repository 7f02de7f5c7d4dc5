//! Client authentication and capabilities
//!
//! The [`AuthGate`] maps a client's TLS identity to a [`Capability`]:
//! - No trust sets configured: every client gets `Write` (open mode)
//! - Otherwise TLS identity is mandatory; unknown or missing identities are
//!   `UNAUTHENTICATED`
//! - Identities in the writable set get `Write`, those only in the readonly
//!   set get `Read`
//!
//! Trust sets are certificate fingerprints loaded once at startup from a
//! PEM file or a directory of PEM files. [`tls`] builds the rustls side.

pub mod tls;

use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use rpc_cache_protocol::{CacheError, CacheResult, Capability};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{ConfigError, TlsConfig};

/// Errors loading trust material
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid PEM in {}: {source}", path.display())]
    Pem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificates found in {}", path.display())]
    Empty { path: PathBuf },

    #[error("no private key found in {}", path.display())]
    NoPrivateKey { path: PathBuf },
}

impl From<AuthError> for ConfigError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Io { .. } => ConfigError::IoError(err.to_string()),
            AuthError::Pem { .. } | AuthError::Empty { .. } | AuthError::NoPrivateKey { .. } => {
                ConfigError::ParseError(err.to_string())
            }
        }
    }
}

/// Identity presented by a TLS client.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientIdentity {
    fingerprint: String,
}

impl ClientIdentity {
    /// Identity of a peer certificate in DER form: the hex SHA-256 of its bytes.
    pub fn from_der(der: &[u8]) -> Self {
        Self {
            fingerprint: hex::encode(Sha256::digest(der)),
        }
    }

    /// Identity from a SHA-256 fingerprint, with or without colons.
    pub fn from_fingerprint(fingerprint: &str) -> Self {
        Self {
            fingerprint: normalize_fingerprint(fingerprint),
        }
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.fingerprint)
    }
}

fn normalize_fingerprint(raw: &str) -> String {
    raw.chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// A set of trusted certificate fingerprints.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustSet {
    fingerprints: BTreeSet<String>,
}

impl TrustSet {
    /// Load certificates from a PEM file or every file in a directory.
    ///
    /// Directory entries are read in name order; hidden files are skipped.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let io_err = |source| AuthError::Io {
            path: path.to_path_buf(),
            source,
        };

        let files = if path.is_dir() {
            let mut files = Vec::new();
            for entry in fs::read_dir(path).map_err(io_err)? {
                let entry = entry.map_err(io_err)?;
                let hidden = entry.file_name().to_string_lossy().starts_with('.');
                if !hidden && entry.file_type().map_err(io_err)?.is_file() {
                    files.push(entry.path());
                }
            }
            files.sort();
            files
        } else {
            vec![path.to_path_buf()]
        };

        let mut set = TrustSet::default();
        for file in &files {
            let certs = tls::load_certs(file)?;
            debug!(path = %file.display(), count = certs.len(), "loaded trusted certificates");
            set.fingerprints
                .extend(certs.iter().map(|der| ClientIdentity::from_der(der.as_ref()).fingerprint));
        }

        if set.is_empty() {
            return Err(AuthError::Empty {
                path: path.to_path_buf(),
            });
        }
        Ok(set)
    }

    pub fn from_fingerprints<I, S>(fingerprints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            fingerprints: fingerprints
                .into_iter()
                .map(|f| normalize_fingerprint(f.as_ref()))
                .collect(),
        }
    }

    pub fn contains(&self, identity: &ClientIdentity) -> bool {
        self.fingerprints.contains(identity.fingerprint())
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Maps client identities to capabilities.
#[derive(Debug, Clone, Default)]
pub struct AuthGate {
    writable: Option<TrustSet>,
    readonly: Option<TrustSet>,
}

impl AuthGate {
    /// Gate that grants `Write` to everyone.
    pub fn open() -> Self {
        Self::default()
    }

    pub fn new(writable: Option<TrustSet>, readonly: Option<TrustSet>) -> Self {
        Self { writable, readonly }
    }

    /// Build the gate from TLS settings, loading any configured trust sets.
    pub fn from_config(tls: &TlsConfig) -> Result<Self, ConfigError> {
        tls.validate()?;
        let writable = tls.writable_certs.as_deref().map(TrustSet::load).transpose()?;
        let readonly = tls.readonly_certs.as_deref().map(TrustSet::load).transpose()?;

        let gate = Self::new(writable, readonly);
        if gate.is_open() {
            info!("no client trust sets configured; all clients may read and write");
        } else {
            info!(
                writable = gate.writable.as_ref().map_or(0, TrustSet::len),
                readonly = gate.readonly.as_ref().map_or(0, TrustSet::len),
                "client authentication enabled"
            );
        }
        Ok(gate)
    }

    /// Whether every client is granted `Write`.
    pub fn is_open(&self) -> bool {
        self.writable.is_none() && self.readonly.is_none()
    }

    /// Capability for a client presenting `identity`.
    pub fn authorize(&self, identity: Option<&ClientIdentity>) -> CacheResult<Capability> {
        if self.is_open() {
            return Ok(Capability::Write);
        }
        let identity = identity.ok_or_else(|| CacheError::unauthenticated("client certificate required"))?;

        if self.writable.as_ref().is_some_and(|set| set.contains(identity)) {
            Ok(Capability::Write)
        } else if self.readonly.as_ref().is_some_and(|set| set.contains(identity)) {
            Ok(Capability::Read)
        } else {
            Err(CacheError::unauthenticated(format!(
                "client certificate {} is not trusted",
                identity
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rpc_cache_protocol::ErrorCode;

    fn id(byte: u8) -> ClientIdentity {
        ClientIdentity::from_der(&[byte; 16])
    }

    fn set_of(ids: &[&ClientIdentity]) -> TrustSet {
        TrustSet::from_fingerprints(ids.iter().map(|i| i.fingerprint().to_string()))
    }

    #[test]
    fn test_open_gate_grants_write() {
        let gate = AuthGate::open();
        assert!(gate.is_open());
        assert_eq!(gate.authorize(None).unwrap(), Capability::Write);
        assert_eq!(gate.authorize(Some(&id(1))).unwrap(), Capability::Write);
    }

    #[test]
    fn test_writable_and_readonly() {
        let (writer, reader) = (id(1), id(2));
        let gate = AuthGate::new(Some(set_of(&[&writer])), Some(set_of(&[&reader])));
        assert_eq!(gate.authorize(Some(&writer)).unwrap(), Capability::Write);
        assert_eq!(gate.authorize(Some(&reader)).unwrap(), Capability::Read);
    }

    #[test]
    fn test_writable_wins_over_readonly() {
        let both = id(3);
        let gate = AuthGate::new(Some(set_of(&[&both])), Some(set_of(&[&both])));
        assert_eq!(gate.authorize(Some(&both)).unwrap(), Capability::Write);
    }

    #[test]
    fn test_unknown_or_missing_identity() {
        let gate = AuthGate::new(None, Some(set_of(&[&id(2)])));
        assert_eq!(gate.authorize(None).unwrap_err().code, ErrorCode::Unauthenticated);
        assert_eq!(gate.authorize(Some(&id(9))).unwrap_err().code, ErrorCode::Unauthenticated);
    }

    #[test]
    fn test_fingerprint_normalization() {
        let identity = ClientIdentity::from_fingerprint("AB:CD:ef");
        assert_eq!(identity.fingerprint(), "abcdef");
        assert!(TrustSet::from_fingerprints(["ab cd EF"]).contains(&identity));
    }
}
