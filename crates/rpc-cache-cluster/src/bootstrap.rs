//! Cluster bootstrap
//!
//! Decides how a node enters the cluster and carries that out:
//! - `Seed`: start a new cluster and wait for `cluster_size` alive nodes
//! - `Join`: contact known addresses, retrying with backoff
//! - `Standalone`: no clustering configured
//!
//! A node told to seed that was also given peer addresses seeds only if none
//! of them resolve. `seed_if` names the node that should seed when nothing
//! resolves yet, so identical deployments can start in any order.

use std::net::ToSocketAddrs;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::{ClusterError, ClusterResult};
use crate::gossip::MembershipHandle;
use crate::transport::GossipTransport;

/// Bootstrap-relevant settings.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BootstrapConfig {
    pub node_name: String,
    pub seed_cluster: bool,
    pub cluster_size: usize,
    pub cluster_addresses: Vec<String>,
    pub seed_if: Option<String>,
}

/// How this node enters the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapPlan {
    Standalone,
    Seed { cluster_size: usize },
    Join { addrs: Vec<String> },
}

/// Name resolution used to decide between seeding and joining.
pub trait Resolver: Send + Sync {
    /// Whether `addr` resolves to at least one address.
    fn resolves(&self, addr: &str) -> bool;
}

/// Resolver backed by the system's name service.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolver for SystemResolver {
    fn resolves(&self, addr: &str) -> bool {
        let found = match addr.to_socket_addrs() {
            Ok(mut addrs) => addrs.next().is_some(),
            Err(_) => (addr, 0u16)
                .to_socket_addrs()
                .map(|mut addrs| addrs.next().is_some())
                .unwrap_or(false),
        };
        if !found {
            warn!(addr, "cluster address does not resolve");
        }
        found
    }
}

impl BootstrapPlan {
    /// Choose the bootstrap plan for `config`.
    pub fn resolve(config: &BootstrapConfig, resolver: &dyn Resolver) -> ClusterResult<Self> {
        let addrs: Vec<String> = config
            .cluster_addresses
            .iter()
            .map(|a| a.trim())
            .filter(|a| !a.is_empty())
            .map(str::to_string)
            .collect();
        let nothing_resolves = || addrs.iter().all(|a| !resolver.resolves(a));

        let seed = match config.seed_if.as_deref() {
            Some(name) if !name.is_empty() && name == config.node_name => nothing_resolves(),
            _ => config.seed_cluster && (addrs.is_empty() || nothing_resolves()),
        };

        if seed {
            if config.cluster_size < 2 {
                return Err(ClusterError::InvalidBootstrap(format!(
                    "seeding requires a cluster size of at least 2 (got {})",
                    config.cluster_size
                )));
            }
            return Ok(BootstrapPlan::Seed {
                cluster_size: config.cluster_size,
            });
        }
        if addrs.is_empty() {
            return Ok(BootstrapPlan::Standalone);
        }
        Ok(BootstrapPlan::Join { addrs })
    }
}

/// Retry schedule for joining.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinRetry {
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for JoinRetry {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(8),
        }
    }
}

/// Start a new cluster with this node and wait until `cluster_size` nodes
/// are alive.
pub async fn seed_cluster(handle: &MembershipHandle, cluster_size: usize, timeout: Option<Duration>) -> ClusterResult<()> {
    handle.activate().await?;
    info!(node = %handle.local().name, cluster_size, "seeding cluster, waiting for members");
    handle.wait_for_alive(cluster_size, timeout).await?;
    info!(cluster_size, "cluster formed");
    Ok(())
}

/// Join an existing cluster through any of `addrs`.
///
/// Each attempt tries every address in order. A rejection (e.g. a name
/// collision) is final; unreachable addresses are retried with exponential
/// backoff until `retry.attempts` is used up.
pub async fn join_cluster(
    handle: &MembershipHandle,
    transport: &dyn GossipTransport,
    addrs: &[String],
    retry: &JoinRetry,
) -> ClusterResult<()> {
    let me = handle.local_record().await?;
    let attempts = retry.attempts.max(1);
    let mut backoff = retry.initial_backoff;

    for attempt in 1..=attempts {
        for addr in addrs {
            match transport.join(addr, me.clone()).await {
                Ok(records) => {
                    let members = records.len();
                    handle.merge(records).await?;
                    handle.activate().await?;
                    info!(via = %addr, members, "joined cluster");
                    return Ok(());
                }
                Err(e @ ClusterError::JoinRejected { .. }) => return Err(e),
                Err(e) => warn!(addr = %addr, attempt, error = %e, "join attempt failed"),
            }
        }
        if attempt < attempts {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(retry.max_backoff);
        }
    }

    Err(ClusterError::JoinFailed {
        addrs: addrs.to_vec(),
        attempts,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    struct FakeResolver(HashSet<&'static str>);

    impl Resolver for FakeResolver {
        fn resolves(&self, addr: &str) -> bool {
            self.0.contains(addr)
        }
    }

    fn resolving(addrs: &[&'static str]) -> FakeResolver {
        FakeResolver(addrs.iter().copied().collect())
    }

    fn config() -> BootstrapConfig {
        BootstrapConfig {
            node_name: "cache-0".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_no_cluster_settings_is_standalone() {
        let plan = BootstrapPlan::resolve(&config(), &resolving(&[])).unwrap();
        assert_eq!(plan, BootstrapPlan::Standalone);
    }

    #[test]
    fn test_seed_requires_cluster_size_two() {
        let cfg = BootstrapConfig {
            seed_cluster: true,
            cluster_size: 1,
            ..config()
        };
        let err = BootstrapPlan::resolve(&cfg, &resolving(&[])).unwrap_err();
        assert!(matches!(err, ClusterError::InvalidBootstrap(_)));

        let cfg = BootstrapConfig { cluster_size: 3, ..cfg };
        let plan = BootstrapPlan::resolve(&cfg, &resolving(&[])).unwrap();
        assert_eq!(plan, BootstrapPlan::Seed { cluster_size: 3 });
    }

    #[test]
    fn test_join_with_addresses() {
        let cfg = BootstrapConfig {
            cluster_addresses: vec!["cache-1:7946".into(), " ".into()],
            ..config()
        };
        let plan = BootstrapPlan::resolve(&cfg, &resolving(&[])).unwrap();
        assert_eq!(
            plan,
            BootstrapPlan::Join {
                addrs: vec!["cache-1:7946".into()]
            }
        );
    }

    #[test]
    fn test_seed_and_peers_prefers_join_when_resolvable() {
        let cfg = BootstrapConfig {
            seed_cluster: true,
            cluster_size: 3,
            cluster_addresses: vec!["cache-1:7946".into()],
            ..config()
        };
        let plan = BootstrapPlan::resolve(&cfg, &resolving(&["cache-1:7946"])).unwrap();
        assert!(matches!(plan, BootstrapPlan::Join { .. }));

        let plan = BootstrapPlan::resolve(&cfg, &resolving(&[])).unwrap();
        assert_eq!(plan, BootstrapPlan::Seed { cluster_size: 3 });
    }

    #[test]
    fn test_seed_if_matching_name() {
        let cfg = BootstrapConfig {
            seed_if: Some("cache-0".into()),
            cluster_size: 3,
            cluster_addresses: vec!["cache.svc:7946".into()],
            ..config()
        };
        let plan = BootstrapPlan::resolve(&cfg, &resolving(&[])).unwrap();
        assert_eq!(plan, BootstrapPlan::Seed { cluster_size: 3 });

        let plan = BootstrapPlan::resolve(&cfg, &resolving(&["cache.svc:7946"])).unwrap();
        assert!(matches!(plan, BootstrapPlan::Join { .. }));
    }

    #[test]
    fn test_seed_if_other_name_joins() {
        let cfg = BootstrapConfig {
            node_name: "cache-1".into(),
            seed_if: Some("cache-0".into()),
            cluster_size: 3,
            cluster_addresses: vec!["cache.svc:7946".into()],
            ..config()
        };
        let plan = BootstrapPlan::resolve(&cfg, &resolving(&[])).unwrap();
        assert!(matches!(plan, BootstrapPlan::Join { .. }));
    }

    #[test]
    fn test_seed_if_overrides_seed_cluster() {
        let cfg = BootstrapConfig {
            seed_cluster: true,
            seed_if: Some("cache-0".into()),
            cluster_size: 3,
            cluster_addresses: vec!["cache.svc:7946".into()],
            ..config()
        };
        let plan = BootstrapPlan::resolve(&cfg, &resolving(&["cache.svc:7946"])).unwrap();
        assert!(matches!(plan, BootstrapPlan::Join { .. }));
    }

    #[test]
    fn test_system_resolver_handles_missing_port() {
        assert!(SystemResolver.resolves("127.0.0.1"));
        assert!(SystemResolver.resolves("127.0.0.1:7946"));
    }
}
