use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::cluster::info::{ClusterInfo, Host};
use crate::cluster::lb::{LbContext, LoadBalancer, RoundRobinBalancer};

use crate::cluster::ResourcePriority;
use crate::net::transport::{Connect, TcpConnector};
use crate::pool::Http1Pool;
use crate::proto::CodecSettings;

/// answer to a host selection request
///
/// `host` present means the choice was synchronous. `pending` carries the
/// waiter for an on-demand resolve; dropping it cancels the selection
/// without any callback.
pub struct HostSelectionResponse {
    pub host: Option<Arc<Host>>,
    pub details: &'static str,
    pub pending: Option<oneshot::Receiver<Option<Arc<Host>>>>,
}

impl HostSelectionResponse {
    pub fn found(host: Arc<Host>) -> Self {
        HostSelectionResponse {
            host: Some(host),
            details: "host_selected",
            pending: None,
        }
    }

    pub fn none(details: &'static str) -> Self {
        HostSelectionResponse {
            host: None,
            details,
            pending: None,
        }
    }

    pub fn deferred(rx: oneshot::Receiver<Option<Arc<Host>>>) -> Self {
        HostSelectionResponse {
            host: None,
            details: "selection_deferred",
            pending: Some(rx),
        }
    }
}

/// builds connectors for hosts; swapped for pipes in tests
pub trait ConnectorFactory: Send + Sync {
    fn connector(&self, host: &Host) -> Arc<dyn Connect>;
}

struct TcpConnectorFactory;

impl ConnectorFactory for TcpConnectorFactory {
    fn connector(&self, host: &Host) -> Arc<dyn Connect> {
        Arc::new(TcpConnector::new(host.endpoint()))
    }
}

/// per-worker face of one cluster: membership view plus its pools
pub struct ThreadLocalCluster {
    info: Arc<ClusterInfo>,
    balancer: Arc<RoundRobinBalancer>,
    // a policy that overrides plain round robin (the dynamic proxy)
    custom_lb: Option<Arc<dyn LoadBalancer>>,
    // pools keyed by priority and host identity + transport hash
    pools: Mutex<HashMap<(ResourcePriority, u64), Arc<Http1Pool>>>,
    connector_factory: Arc<dyn ConnectorFactory>,
    upstream_settings: CodecSettings,
}

impl ThreadLocalCluster {
    pub fn info(&self) -> &Arc<ClusterInfo> {
        &self.info
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.balancer.hosts()
    }

    pub fn choose_host(&self, ctx: &LbContext<'_>) -> HostSelectionResponse {
        let chosen = match &self.custom_lb {
            Some(lb) => lb.choose_host(ctx),
            None => self.balancer.choose_host(ctx),
        };
        match chosen {
            Some(host) => HostSelectionResponse::found(host),
            None => HostSelectionResponse::none("no_healthy_host"),
        }
    }

    /// pool for `(host, priority)`, created on first use
    pub fn http_conn_pool(
        &self,
        host: &Arc<Host>,
        priority: ResourcePriority,
    ) -> Arc<Http1Pool> {
        let key = (priority, host.hash_key() ^ self.info.transport.hash_key());
        let mut pools = self.pools.lock();
        pools
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(
                    cluster = %self.info.name,
                    host = %host.endpoint(),
                    ?priority,
                    "creating connection pool"
                );
                Arc::new(Http1Pool::new(
                    host.clone(),
                    self.info.clone(),
                    priority,
                    self.connector_factory.connector(host),
                    self.upstream_settings.clone(),
                ))
            })
            .clone()
    }

    /// membership refresh from discovery
    pub fn update_hosts(&self, hosts: Vec<Arc<Host>>) {
        self.balancer.update_hosts(hosts);
    }
}

/// observers of cluster set changes (the dynamic proxy listens here)
pub trait ClusterUpdateListener: Send + Sync {
    fn on_cluster_add_or_update(&self, name: &str, cluster: &Arc<ThreadLocalCluster>);
    fn on_cluster_removed(&self, name: &str);
}

/// the canonical cluster set, snapshot-swapped on every mutation
///
/// readers grab the current snapshot without locking; mutations build the
/// next map and swap it in, then fan out to listeners.
pub struct ClusterManager {
    clusters: ArcSwap<HashMap<String, Arc<ThreadLocalCluster>>>,
    listeners: Mutex<Vec<Arc<dyn ClusterUpdateListener>>>,
    connector_factory: Arc<dyn ConnectorFactory>,
    upstream_settings: CodecSettings,
}

impl ClusterManager {
    pub fn new(upstream_settings: CodecSettings) -> Arc<Self> {
        Arc::new(ClusterManager {
            clusters: ArcSwap::from_pointee(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            connector_factory: Arc::new(TcpConnectorFactory),
            upstream_settings,
        })
    }

    pub fn with_connector_factory(
        upstream_settings: CodecSettings,
        connector_factory: Arc<dyn ConnectorFactory>,
    ) -> Arc<Self> {
        Arc::new(ClusterManager {
            clusters: ArcSwap::from_pointee(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            connector_factory,
            upstream_settings,
        })
    }

    /// `None` means unknown or not yet propagated; callers treat it as a
    /// transient lookup failure
    pub fn get(&self, name: &str) -> Option<Arc<ThreadLocalCluster>> {
        self.clusters.load().get(name).cloned()
    }

    pub fn cluster_names(&self) -> Vec<String> {
        self.clusters.load().keys().cloned().collect()
    }

    pub fn add_update_listener(&self, listener: Arc<dyn ClusterUpdateListener>) {
        self.listeners.lock().push(listener);
    }

    /// install or refresh a cluster and notify listeners
    pub fn add_or_update_cluster(
        &self,
        info: Arc<ClusterInfo>,
        hosts: Vec<Arc<Host>>,
    ) -> Arc<ThreadLocalCluster> {
        self.add_or_update_cluster_with_lb(info, hosts, None)
    }

    /// install a cluster whose host choice is delegated to `custom_lb`
    pub fn add_or_update_cluster_with_lb(
        &self,
        info: Arc<ClusterInfo>,
        hosts: Vec<Arc<Host>>,
        custom_lb: Option<Arc<dyn LoadBalancer>>,
    ) -> Arc<ThreadLocalCluster> {
        let name = info.name.clone();
        let existing = self.get(&name);
        let cluster = match existing {
            Some(cluster) => {
                cluster.update_hosts(hosts);
                cluster
            }
            None => {
                let cluster = Arc::new(ThreadLocalCluster {
                    info,
                    balancer: Arc::new(RoundRobinBalancer::new(hosts)),
                    custom_lb,
                    pools: Mutex::new(HashMap::new()),
                    connector_factory: self.connector_factory.clone(),
                    upstream_settings: self.upstream_settings.clone(),
                });
                self.clusters.rcu(|current| {
                    let mut next = HashMap::clone(current);
                    next.insert(name.clone(), cluster.clone());
                    next
                });
                cluster
            }
        };
        tracing::debug!(cluster = %name, "cluster added or updated");
        for listener in self.listeners.lock().iter() {
            listener.on_cluster_add_or_update(&name, &cluster);
        }
        cluster
    }

    pub fn remove_cluster(&self, name: &str) {
        self.clusters.rcu(|current| {
            let mut next = HashMap::clone(current);
            next.remove(name);
            next
        });
        tracing::debug!(cluster = %name, "cluster removed");
        for listener in self.listeners.lock().iter() {
            listener.on_cluster_removed(name);
        }
    }
}
