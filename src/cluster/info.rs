use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHasher;

use crate::cluster::resource::{ResourceLimits, ResourceManager};
use crate::net::transport::{RawBufferSocketFactory, TransportSocketFactory};

/// how a cluster learns its members
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryType {
    Static,
    StrictDns,
    LogicalDns,
    DynamicForwardProxy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LbPolicy {
    #[default]
    RoundRobin,
}

/// immutable description of a named upstream target group
pub struct ClusterInfo {
    pub name: String,
    pub discovery: DiscoveryType,
    pub lb_policy: LbPolicy,
    pub connect_timeout: Duration,
    /// 0 means unlimited
    pub max_requests_per_connection: u64,
    pub resources: ResourceManager,
    pub transport: Arc<dyn TransportSocketFactory>,
}

impl ClusterInfo {
    pub fn new(name: impl Into<String>, discovery: DiscoveryType) -> Self {
        ClusterInfo {
            name: name.into(),
            discovery,
            lb_policy: LbPolicy::RoundRobin,
            connect_timeout: Duration::from_secs(5),
            max_requests_per_connection: 0,
            resources: ResourceManager::new(ResourceLimits::default()),
            transport: Arc::new(RawBufferSocketFactory),
        }
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.resources = ResourceManager::new(limits);
        self
    }
}

impl std::fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("name", &self.name)
            .field("discovery", &self.discovery)
            .finish()
    }
}

/// one endpoint within a cluster
#[derive(Debug)]
pub struct Host {
    pub cluster: String,
    pub address: String,
    pub port: u16,
    pub canonical_hostname: Option<String>,
    healthy: AtomicBool,
}

impl Host {
    pub fn new(cluster: impl Into<String>, address: impl Into<String>, port: u16) -> Arc<Self> {
        Arc::new(Host {
            cluster: cluster.into(),
            address: address.into(),
            port,
            canonical_hostname: None,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn with_hostname(
        cluster: impl Into<String>,
        address: impl Into<String>,
        port: u16,
        hostname: impl Into<String>,
    ) -> Arc<Self> {
        Arc::new(Host {
            cluster: cluster.into(),
            address: address.into(),
            port,
            canonical_hostname: Some(hostname.into()),
            healthy: AtomicBool::new(true),
        })
    }

    /// dialable `host:port`
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
    }

    /// identity component of the pool hash key
    pub fn hash_key(&self) -> u64 {
        let mut hasher = AHasher::default();
        self.cluster.hash(&mut hasher);
        self.address.hash(&mut hasher);
        self.port.hash(&mut hasher);
        hasher.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_format() {
        let host = Host::new("c", "10.0.0.1", 8080);
        assert_eq!(host.endpoint(), "10.0.0.1:8080");
    }

    #[test]
    fn hash_key_distinguishes_hosts() {
        let a = Host::new("c", "10.0.0.1", 80);
        let b = Host::new("c", "10.0.0.1", 81);
        assert_ne!(a.hash_key(), b.hash_key());
    }
}
