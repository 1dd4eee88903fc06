use std::sync::{Arc, Weak};

use crate::cluster::info::Host;
use crate::cluster::lb::{LbContext, LoadBalancer};
use crate::cluster::manager::ClusterManager;
use crate::dfp::filter::parse_authority;
use crate::dfp::store::DfpClusterStore;
use crate::dfp::sub_cluster_name;
use crate::filter::state::keys;

/// host chooser for the dynamic-forward-proxy umbrella cluster
///
/// target derivation order: the per-request filter state the dfp filter
/// seeded, then the downstream `host` header, then the connection's
/// server name. in sub-cluster mode the derived sub-cluster picks the
/// host; otherwise the resolved-host cache answers directly.
pub struct DfpLoadBalancer {
    cluster_manager: Weak<ClusterManager>,
    store: Arc<DfpClusterStore>,
    sub_cluster_mode: bool,
}

impl DfpLoadBalancer {
    pub fn new(
        cluster_manager: &Arc<ClusterManager>,
        store: Arc<DfpClusterStore>,
        sub_cluster_mode: bool,
    ) -> Arc<Self> {
        Arc::new(DfpLoadBalancer {
            cluster_manager: Arc::downgrade(cluster_manager),
            store,
            sub_cluster_mode,
        })
    }

    fn target(&self, ctx: &LbContext<'_>) -> Option<(String, u16)> {
        if let Some(state) = ctx.filter_state {
            if let (Some(host), Some(port)) = (
                state.get::<String>(keys::DYNAMIC_HOST),
                state.get::<u16>(keys::DYNAMIC_PORT),
            ) {
                return Some((host, port));
            }
        }
        if let Some(headers) = ctx.headers {
            if let Some(authority) = headers.host() {
                return Some(parse_authority(authority, headers.scheme()));
            }
        }
        // sni implies tls
        ctx.downstream_server_name
            .map(|name| (name.to_ascii_lowercase(), 443))
    }
}

impl LoadBalancer for DfpLoadBalancer {
    fn choose_host(&self, ctx: &LbContext<'_>) -> Option<Arc<Host>> {
        let (host, port) = self.target(ctx)?;
        if self.sub_cluster_mode {
            let name = sub_cluster_name(&host, port);
            if !self.store.touch(&name) {
                tracing::debug!(cluster = %name, "sub-cluster gone, host selection fails");
                return None;
            }
            let cluster_manager = self.cluster_manager.upgrade()?;
            let sub = cluster_manager.get(&name)?;
            sub.choose_host(&LbContext::empty()).host
        } else {
            self.store.cached_host(&format!("{}:{}", host, port))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::info::{ClusterInfo, DiscoveryType};
    use crate::dfp::store::SubClusterInfo;
    use crate::filter::state::{ConnectionState, FilterState, Lifespan, Mutability};
    use crate::headers::HeaderMap;
    use crate::proto::CodecSettings;

    fn seeded_state(host: &str, port: u16) -> FilterState {
        let mut state = FilterState::new(ConnectionState::default());
        state.set(
            keys::DYNAMIC_HOST,
            host.to_string(),
            Lifespan::Request,
            Mutability::ReadOnly,
        );
        state.set(keys::DYNAMIC_PORT, port, Lifespan::Request, Mutability::ReadOnly);
        state
    }

    #[test]
    fn per_host_mode_reads_cache() {
        let cm = ClusterManager::new(CodecSettings::default());
        let store = DfpClusterStore::new();
        store.cache_host("x.test:80".into(), Host::new("dfp", "x.test", 80));
        let lb = DfpLoadBalancer::new(&cm, store, false);

        let state = seeded_state("x.test", 80);
        let ctx = LbContext {
            headers: None,
            filter_state: Some(&state),
            downstream_server_name: None,
        };
        assert_eq!(lb.choose_host(&ctx).unwrap().endpoint(), "x.test:80");
    }

    #[test]
    fn sub_cluster_mode_delegates() {
        let cm = ClusterManager::new(CodecSettings::default());
        let store = DfpClusterStore::new();
        let name = sub_cluster_name("y.test", 443);
        let info = Arc::new(ClusterInfo::new(name.clone(), DiscoveryType::StrictDns));
        store.save(name.clone(), SubClusterInfo::new(info.clone()));
        cm.add_or_update_cluster(info, vec![Host::new(&name, "y.test", 443)]);
        let lb = DfpLoadBalancer::new(&cm, store.clone(), true);

        let state = seeded_state("y.test", 443);
        let ctx = LbContext {
            headers: None,
            filter_state: Some(&state),
            downstream_server_name: None,
        };
        assert_eq!(lb.choose_host(&ctx).unwrap().endpoint(), "y.test:443");

        // reaped sub-cluster stops selecting
        store.remove(&name);
        assert!(lb.choose_host(&ctx).is_none());
    }

    #[test]
    fn falls_back_to_host_header_then_sni() {
        let cm = ClusterManager::new(CodecSettings::default());
        let store = DfpClusterStore::new();
        store.cache_host("h.test:80".into(), Host::new("dfp", "h.test", 80));
        store.cache_host("sni.test:443".into(), Host::new("dfp", "sni.test", 443));
        let lb = DfpLoadBalancer::new(&cm, store, false);

        let mut headers = HeaderMap::new();
        headers.set_host("h.test");
        let ctx = LbContext {
            headers: Some(&headers),
            filter_state: None,
            downstream_server_name: Some("sni.test"),
        };
        assert_eq!(lb.choose_host(&ctx).unwrap().endpoint(), "h.test:80");

        let ctx = LbContext {
            headers: None,
            filter_state: None,
            downstream_server_name: Some("sni.test"),
        };
        assert_eq!(lb.choose_host(&ctx).unwrap().endpoint(), "sni.test:443");
    }
}
