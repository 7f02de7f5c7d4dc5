//! Server configuration
//!
//! The configuration is built once at startup from three layers, lowest
//! precedence first:
//! 1. Built-in defaults
//! 2. TOML file (`--config`)
//! 3. CLI flags
//!
//! Node name and advertise address additionally fall back to the `NODE_NAME`
//! and `NODE_IP` environment variables when neither layer sets them.
//!
//! The result is an immutable [`ServerConfig`] handed to each component's
//! constructor. Validation failures are fatal: the server does not start.

mod merge;
pub mod units;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rpc_cache_cluster::{BootstrapConfig, GossipConfig, JoinRetry, MembershipConfig};
use rpc_cache_protocol::CacheError;
use rpc_cache_store::{EvictionPolicy, StoreConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use merge::{deep_merge, merge_layers};
pub use units::{ByteSize, HumanDuration, UnitError};

/// Environment variable naming this node
pub const ENV_NODE_NAME: &str = "NODE_NAME";

/// Environment variable with the address to advertise to peers
pub const ENV_NODE_IP: &str = "NODE_IP";

/// Name of a standalone node when none is configured. Clustered nodes must
/// be named explicitly.
pub const DEFAULT_NODE_NAME: &str = "node";

/// Complete server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port serving client requests
    pub port: u16,

    /// Interface to bind listeners on
    pub bind: String,

    /// Directory artifacts are stored in
    pub dir: PathBuf,

    /// Upper bound on any request, including forwarding
    pub request_timeout: HumanDuration,

    /// Retention settings
    pub clean: CleanConfig,

    /// TLS and client trust settings
    pub tls: TlsConfig,

    /// Clustering settings
    pub cluster: ClusterConfig,
}

/// Options controlling when to clean the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanConfig {
    /// Size of cache to clean down to
    pub low_water_mark: ByteSize,
    /// Max size of cache before cleaning starts
    pub high_water_mark: ByteSize,
    /// Interval between cleaning cycles
    pub clean_frequency: HumanDuration,
    /// Remove any artifact not read in this long
    pub max_artifact_age: HumanDuration,
}

/// Options controlling TLS communication and authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM-encoded private key of the server
    pub key_file: Option<PathBuf>,
    /// PEM-encoded certificate of the server
    pub cert_file: Option<PathBuf>,
    /// PEM-encoded CA certificate used to verify clients
    pub ca_cert_file: Option<PathBuf>,
    /// File or directory of certificates allowed to write
    pub writable_certs: Option<PathBuf>,
    /// File or directory of certificates allowed to read
    pub readonly_certs: Option<PathBuf>,
}

/// Options controlling clustering behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Port for gossip and peer requests
    pub cluster_port: u16,
    /// Addresses of nodes to join
    pub cluster_addresses: Vec<String>,
    /// Seed a new cluster
    pub seed_cluster: bool,
    /// Number of nodes to expect; required when seeding
    pub cluster_size: usize,
    /// Name of this node in the cluster
    pub node_name: Option<String>,
    /// Seed (overriding `seed_cluster`) if `node_name` matches and no
    /// cluster address resolves
    pub seed_if: Option<String>,
    /// Address advertised to other nodes
    pub advertise_addr: Option<String>,
    /// Owners per key
    pub replication_factor: usize,
    /// Send writes received by a non-primary to the primary owner
    pub forward_writes: bool,
    /// Gossip round and heartbeat interval
    pub gossip_interval: HumanDuration,
    /// Silent intervals before a node is suspected
    pub missed_heartbeats: u32,
    /// Time a suspected node has to recover before it is dead
    pub dead_timeout: HumanDuration,
    /// Time a dead node is remembered
    pub dead_retention: HumanDuration,
    /// Interval of the background repair task
    pub repair_interval: HumanDuration,
    /// Join attempts before giving up
    pub join_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7677,
            bind: "0.0.0.0".to_string(),
            dir: PathBuf::from("plz-rpc-cache"),
            request_timeout: HumanDuration::secs(30),
            clean: CleanConfig::default(),
            tls: TlsConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            low_water_mark: ByteSize::gib(18),
            high_water_mark: ByteSize::gib(20),
            clean_frequency: HumanDuration::secs(10 * 60),
            max_artifact_age: HumanDuration::secs(720 * 3600),
        }
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            cluster_port: 7946,
            cluster_addresses: Vec::new(),
            seed_cluster: false,
            cluster_size: 0,
            node_name: None,
            seed_if: None,
            advertise_addr: None,
            replication_factor: 2,
            forward_writes: true,
            gossip_interval: HumanDuration::secs(1),
            missed_heartbeats: 3,
            dead_timeout: HumanDuration::secs(15),
            dead_retention: HumanDuration::secs(60),
            repair_interval: HumanDuration::secs(30),
            join_attempts: 5,
        }
    }
}

/// Origin of a configuration layer
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Env,
    Cli,
}

/// A contributing configuration layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    /// File path (file layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// SHA-256 of the raw file bytes (file layer only)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Validated configuration plus the layers it came from.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: ServerConfig,
    pub sources: Vec<ConfigSource>,
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

impl From<ConfigError> for CacheError {
    fn from(err: ConfigError) -> Self {
        CacheError::config(err.to_string())
    }
}

impl ServerConfig {
    /// Load configuration using the process environment.
    pub fn load(file: Option<&Path>, cli: Option<Value>) -> Result<LoadedConfig, ConfigError> {
        Self::load_with_env(file, cli, |name| std::env::var(name).ok())
    }

    /// Load configuration, reading environment fallbacks through `env`.
    pub fn load_with_env(
        file: Option<&Path>,
        cli: Option<Value>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<LoadedConfig, ConfigError> {
        let mut layers = Vec::new();
        let mut sources = Vec::new();

        let builtin = serde_json::to_value(ServerConfig::default())
            .map_err(|e| ConfigError::ParseError(format!("defaults: {}", e)))?;
        layers.push(builtin);
        sources.push(ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        });

        if let Some(path) = file {
            let (value, digest) = load_toml_file(path)?;
            layers.push(value);
            sources.push(ConfigSource {
                origin: ConfigOrigin::File,
                path: Some(path.to_string_lossy().to_string()),
                digest: Some(digest),
            });
        }

        if let Some(cli) = cli {
            layers.push(cli);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let mut config: ServerConfig =
            serde_json::from_value(merged).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        let mut from_env = false;
        if config.cluster.node_name.is_none() {
            config.cluster.node_name = env(ENV_NODE_NAME).filter(|v| !v.is_empty());
            from_env |= config.cluster.node_name.is_some();
        }
        if config.cluster.advertise_addr.is_none() {
            config.cluster.advertise_addr = env(ENV_NODE_IP).filter(|v| !v.is_empty());
            from_env |= config.cluster.advertise_addr.is_some();
        }
        if from_env {
            sources.push(ConfigSource {
                origin: ConfigOrigin::Env,
                path: None,
                digest: None,
            });
        }

        config.validate()?;
        Ok(LoadedConfig { config, sources })
    }

    /// Check the configuration for contradictions.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.tls.validate()?;

        if self.cluster.seed_cluster && self.cluster.cluster_size < 2 {
            return Err(ConfigError::ValidationError(
                "you must pass a cluster size of at least 2 when seeding a cluster".to_string(),
            ));
        }
        if self.clean.low_water_mark > self.clean.high_water_mark {
            return Err(ConfigError::ValidationError(format!(
                "low_water_mark ({}) must not exceed high_water_mark ({})",
                self.clean.low_water_mark, self.clean.high_water_mark
            )));
        }
        if self.cluster.replication_factor == 0 {
            return Err(ConfigError::ValidationError(
                "replication_factor must be at least 1".to_string(),
            ));
        }
        if self.cluster.missed_heartbeats == 0 {
            return Err(ConfigError::ValidationError(
                "missed_heartbeats must be at least 1".to_string(),
            ));
        }
        let intervals = [
            ("clean_frequency", self.clean.clean_frequency),
            ("gossip_interval", self.cluster.gossip_interval),
            ("repair_interval", self.cluster.repair_interval),
            ("request_timeout", self.request_timeout),
        ];
        for (name, value) in intervals {
            if value.get().is_zero() {
                return Err(ConfigError::ValidationError(format!("{} must be non-zero", name)));
            }
        }
        if self.node_name().is_empty() {
            return Err(ConfigError::ValidationError("node_name must not be empty".to_string()));
        }
        if self.is_clustered() && self.cluster.node_name.is_none() {
            return Err(ConfigError::ValidationError(format!(
                "node_name (or {}) must be set when clustering; every node needs a distinct name",
                ENV_NODE_NAME
            )));
        }
        Ok(())
    }

    /// Whether any clustering option is set.
    pub fn is_clustered(&self) -> bool {
        self.cluster.seed_cluster || self.cluster.seed_if.is_some() || !self.cluster.cluster_addresses.is_empty()
    }

    pub fn node_name(&self) -> &str {
        self.cluster.node_name.as_deref().unwrap_or(DEFAULT_NODE_NAME)
    }

    /// Host advertised to peers.
    pub fn advertise_host(&self) -> &str {
        match self.cluster.advertise_addr.as_deref() {
            Some(addr) => addr,
            None if self.bind == "0.0.0.0" || self.bind == "::" => "127.0.0.1",
            None => &self.bind,
        }
    }

    /// Address peers reach this node's cluster port on.
    pub fn advertise_cluster_addr(&self) -> String {
        format!("{}:{}", self.advertise_host(), self.cluster.cluster_port)
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout.get()
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig::new(self.dir.clone())
    }

    pub fn eviction_policy(&self) -> EvictionPolicy {
        EvictionPolicy {
            low_water_mark: self.clean.low_water_mark.bytes(),
            high_water_mark: self.clean.high_water_mark.bytes(),
            max_artifact_age: self.clean.max_artifact_age.get(),
            clean_frequency: self.clean.clean_frequency.get(),
        }
    }

    pub fn bootstrap_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            node_name: self.node_name().to_string(),
            seed_cluster: self.cluster.seed_cluster,
            cluster_size: self.cluster.cluster_size,
            cluster_addresses: self.cluster.cluster_addresses.clone(),
            seed_if: self.cluster.seed_if.clone(),
        }
    }

    pub fn gossip_config(&self) -> GossipConfig {
        GossipConfig {
            membership: MembershipConfig {
                heartbeat_interval: self.cluster.gossip_interval.get(),
                missed_heartbeats: self.cluster.missed_heartbeats,
                dead_timeout: self.cluster.dead_timeout.get(),
                dead_retention: self.cluster.dead_retention.get(),
            },
            replication_factor: self.cluster.replication_factor,
            ..GossipConfig::default()
        }
    }

    pub fn join_retry(&self) -> JoinRetry {
        JoinRetry {
            attempts: self.cluster.join_attempts,
            ..JoinRetry::default()
        }
    }
}

impl TlsConfig {
    /// Whether client trust sets are configured.
    pub fn has_trust_sets(&self) -> bool {
        self.writable_certs.is_some() || self.readonly_certs.is_some()
    }

    /// Reject client authentication without server TLS.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.key_file.is_some() != self.cert_file.is_some() {
            return Err(ConfigError::ValidationError(
                "must pass both key_file and cert_file if you pass one".to_string(),
            ));
        }
        if self.key_file.is_none() && self.has_trust_sets() {
            return Err(ConfigError::ValidationError(
                "writable_certs / readonly_certs require key_file and cert_file".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load and parse a TOML file, returning the value and its digest
fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|e| ConfigError::IoError(format!("{}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let digest = hex::encode(hasher.finalize());

    let contents =
        String::from_utf8(bytes).map_err(|e| ConfigError::ParseError(format!("Invalid UTF-8: {}", e)))?;
    let toml_value: toml::Value =
        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(format!("TOML parse error: {}", e)))?;

    Ok((merge::toml_to_json(toml_value), digest))
}
