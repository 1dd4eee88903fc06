use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::cluster::info::Host;
use crate::filter::state::FilterState;
use crate::headers::HeaderMap;

/// request context a balancer may consult
pub struct LbContext<'a> {
    pub headers: Option<&'a HeaderMap>,
    pub filter_state: Option<&'a FilterState>,
    /// sni or absolute-form host from the downstream connection
    pub downstream_server_name: Option<&'a str>,
}

impl<'a> LbContext<'a> {
    pub fn empty() -> Self {
        LbContext {
            headers: None,
            filter_state: None,
            downstream_server_name: None,
        }
    }
}

/// picks one host out of a cluster for a request
pub trait LoadBalancer: Send + Sync {
    fn choose_host(&self, ctx: &LbContext<'_>) -> Option<Arc<Host>>;
}

/// round robin over the healthy member set
pub struct RoundRobinBalancer {
    hosts: ArcSwap<Vec<Arc<Host>>>,
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new(hosts: Vec<Arc<Host>>) -> Self {
        RoundRobinBalancer {
            hosts: ArcSwap::from_pointee(hosts),
            counter: AtomicU64::new(0),
        }
    }

    pub fn update_hosts(&self, hosts: Vec<Arc<Host>>) {
        self.hosts.store(Arc::new(hosts));
    }

    pub fn hosts(&self) -> Vec<Arc<Host>> {
        self.hosts.load().as_ref().clone()
    }
}

impl LoadBalancer for RoundRobinBalancer {
    fn choose_host(&self, _ctx: &LbContext<'_>) -> Option<Arc<Host>> {
        let hosts = self.hosts.load();
        let healthy: Vec<&Arc<Host>> = hosts.iter().filter(|h| h.is_healthy()).collect();
        if healthy.is_empty() {
            return None;
        }
        let index = self.counter.fetch_add(1, Ordering::Relaxed) as usize % healthy.len();
        Some(healthy[index].clone())
    }
}
