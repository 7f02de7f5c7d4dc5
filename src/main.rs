//! RPC cache server
//!
//! Entry point for the `rpc-cache-server` binary.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;

use rpc_cache_server::config::{ByteSize, HumanDuration};
use rpc_cache_server::{CacheServer, ServerConfig, SignalHandler};

/// Remote artifact cache server for build clients.
#[derive(Parser, Debug)]
#[command(name = "rpc-cache-server", about, version)]
struct Cli {
    /// TOML configuration file
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Port to serve client requests on
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Interface to bind listeners on
    #[arg(long)]
    bind: Option<String>,

    /// Directory to store artifacts in
    #[arg(long, short = 'd')]
    dir: Option<PathBuf>,

    /// Upper bound on any request, e.g. 30s
    #[arg(long)]
    request_timeout: Option<HumanDuration>,

    /// Verbosity of output (0 = errors only, 4 = everything)
    #[arg(long, short = 'v', default_value_t = 2)]
    verbosity: u8,

    /// File to append log output to, in addition to stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,

    /// Size of cache to clean down to
    #[arg(long, short = 'l', help_heading = "Cleaning")]
    low_water_mark: Option<ByteSize>,

    /// Max size of cache to clean at
    #[arg(long, short = 'i', help_heading = "Cleaning")]
    high_water_mark: Option<ByteSize>,

    /// Frequency to run cache cleaner at
    #[arg(long, short = 'f', help_heading = "Cleaning")]
    clean_frequency: Option<HumanDuration>,

    /// Clean any artifact that hasn't been read in this long
    #[arg(long, short = 'm', help_heading = "Cleaning")]
    max_artifact_age: Option<HumanDuration>,

    /// File containing PEM-encoded private key
    #[arg(long, help_heading = "TLS")]
    key_file: Option<PathBuf>,

    /// File containing PEM-encoded certificate
    #[arg(long, help_heading = "TLS")]
    cert_file: Option<PathBuf>,

    /// File containing PEM-encoded CA certificate
    #[arg(long, help_heading = "TLS")]
    ca_cert_file: Option<PathBuf>,

    /// File or directory containing certificates that are allowed to write to the cache
    #[arg(long, help_heading = "TLS")]
    writable_certs: Option<PathBuf>,

    /// File or directory containing certificates that are allowed to read from the cache
    #[arg(long, help_heading = "TLS")]
    readonly_certs: Option<PathBuf>,

    /// Port to gossip among cluster nodes on
    #[arg(long, help_heading = "Cluster")]
    cluster_port: Option<u16>,

    /// Comma-separated addresses of one or more nodes to join a cluster
    #[arg(long, short = 'a', value_delimiter = ',', help_heading = "Cluster")]
    cluster_addresses: Option<Vec<String>>,

    /// Seeds a new cache cluster
    #[arg(long, help_heading = "Cluster")]
    seed_cluster: bool,

    /// Number of nodes to expect in the cluster; required when seeding
    #[arg(long, short = 'n', help_heading = "Cluster")]
    cluster_size: Option<usize>,

    /// Name of this node in the cluster [env NODE_NAME]
    #[arg(long, help_heading = "Cluster")]
    node_name: Option<String>,

    /// Seed the cluster if this matches the node name and no cluster address resolves
    #[arg(long, help_heading = "Cluster")]
    seed_if: Option<String>,

    /// Address to advertise to other nodes [env NODE_IP]
    #[arg(long, help_heading = "Cluster")]
    advertise_addr: Option<String>,

    /// Owners per key
    #[arg(long, help_heading = "Cluster")]
    replication_factor: Option<usize>,
}

impl Cli {
    /// Explicitly given flags as a config layer; absent flags are null.
    fn overrides(&self) -> Value {
        json!({
            "port": self.port,
            "bind": self.bind,
            "dir": self.dir,
            "request_timeout": self.request_timeout,
            "clean": {
                "low_water_mark": self.low_water_mark,
                "high_water_mark": self.high_water_mark,
                "clean_frequency": self.clean_frequency,
                "max_artifact_age": self.max_artifact_age,
            },
            "tls": {
                "key_file": self.key_file,
                "cert_file": self.cert_file,
                "ca_cert_file": self.ca_cert_file,
                "writable_certs": self.writable_certs,
                "readonly_certs": self.readonly_certs,
            },
            "cluster": {
                "cluster_port": self.cluster_port,
                "cluster_addresses": self.cluster_addresses,
                "seed_cluster": self.seed_cluster.then_some(true),
                "cluster_size": self.cluster_size,
                "node_name": self.node_name,
                "seed_if": self.seed_if,
                "advertise_addr": self.advertise_addr,
                "replication_factor": self.replication_factor,
            },
        })
    }
}

fn level_for(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "error",
        1 => "warn",
        2 => "info",
        3 => "debug",
        _ => "trace",
    }
}

fn init_tracing(cli: &Cli) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_for(cli.verbosity)));

    let writer = match &cli.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            BoxMakeWriter::new(std::io::stderr.and(Mutex::new(file)))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(cli.log_file.is_none());
    if cli.log_json {
        builder.json().init();
    } else {
        builder.with_target(false).init();
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let loaded = ServerConfig::load(cli.config.as_deref(), Some(cli.overrides())).context("invalid configuration")?;
    for source in &loaded.sources {
        debug!(origin = ?source.origin, path = ?source.path, digest = ?source.digest, "config layer");
    }

    let shutdown = CancellationToken::new();
    SignalHandler::new()
        .install(shutdown.clone())
        .context("installing signal handlers")?;

    let server = tokio::select! {
        started = CacheServer::start(loaded.config) => started.context("starting server")?,
        _ = shutdown.cancelled() => {
            info!("interrupted during startup");
            return Ok(());
        }
    };

    shutdown.cancelled().await;
    server.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = init_tracing(&cli) {
        eprintln!("Error initializing logging: {:#}", e);
        return ExitCode::FAILURE;
    }

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}
