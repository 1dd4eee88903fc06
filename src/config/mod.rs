use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use http::{Method, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use crate::cluster::info::{ClusterInfo, DiscoveryType, Host};
use crate::cluster::manager::ClusterManager;
use crate::cluster::resource::ResourceLimits;
use crate::conn::manager::HcmConfig;
use crate::dfp::cluster::{DfpCluster, DfpWorkerState};
use crate::dfp::lb::DfpLoadBalancer;
use crate::dfp::store::DfpClusterStore;
use crate::filter::local_reply::DefaultLocalReply;
use crate::net::listener::ListenerAddress;
use crate::proto::CodecSettings;
use crate::router::route::{
    DirectResponse, Route, RouteAction, RouteConfig, RouteEntry, RouteMatch,
};
use crate::server::{ProxyFilterChain, Server};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::Invalid(message.into())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CodecType {
    #[default]
    Http1,
    Http2,
    Http3,
    Auto,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct H1Options {
    pub allow_absolute_url: Option<bool>,
    pub accept_http_10: Option<bool>,
    pub allow_chunked_length: Option<bool>,
    pub stream_error_on_invalid_http_message: Option<bool>,
    pub enable_trailers: Option<bool>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct ConnectionManagerConfig {
    #[serde(default)]
    pub codec_type: CodecType,
    pub max_request_headers_kb: Option<usize>,
    pub max_request_headers_count: Option<usize>,
    pub max_requests_per_connection: Option<u64>,
    pub proxy_100_continue: Option<bool>,
    pub force_reset_on_premature_upstream_half_close: Option<bool>,
    pub buffer_limit_bytes: Option<usize>,
    pub http_protocol_options: Option<H1Options>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    // mandatory cluster identity
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub discovery: Option<String>,
    pub lb_policy: Option<String>,
    pub connect_timeout: Option<u64>,
    pub lb_endpoints: Option<Vec<String>>,
    pub max_requests_per_connection: Option<u64>,
    pub max_connections: Option<u64>,
    pub max_pending_requests: Option<u64>,
    pub max_requests: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RouteEntryConfig {
    pub name: Option<String>,
    pub prefix: Option<String>,
    pub host: Option<String>,
    pub methods: Option<Vec<String>>,
    pub cluster: Option<String>,
    pub direct_status: Option<u16>,
    pub direct_body: Option<String>,
    pub prefix_rewrite: Option<String>,
    pub host_rewrite: Option<String>,
    pub request_headers_to_add: Option<BTreeMap<String, String>>,
    pub request_headers_to_remove: Option<Vec<String>>,
    pub response_headers_to_add: Option<BTreeMap<String, String>>,
    pub response_headers_to_remove: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub address: Option<String>,
    pub unix_path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct DfpOptions {
    pub cluster_name: Option<String>,
    pub sub_cluster_ttl: Option<u64>,
}

/// the whole YAML surface
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProxyConfig {
    pub listeners: Vec<ListenerConfig>,
    pub connection_manager: Option<ConnectionManagerConfig>,
    pub clusters: Option<Vec<ClusterConfig>>,
    pub routes: Option<Vec<RouteEntryConfig>>,
}

/// everything wired and ready to run
pub struct BuiltProxy {
    pub server: Server,
    pub cluster_manager: Arc<ClusterManager>,
    pub routes: Arc<ArcSwap<RouteConfig>>,
}

impl std::fmt::Debug for BuiltProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuiltProxy").finish_non_exhaustive()
    }
}

impl ProxyConfig {
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// validate and assemble the runtime pieces
    pub fn build(self) -> Result<BuiltProxy, ConfigError> {
        let cm_config = self.connection_manager.unwrap_or_default();
        match cm_config.codec_type {
            CodecType::Http1 | CodecType::Auto => {}
            other => {
                return Err(invalid(format!(
                    "codec type {:?} is not available, only http1",
                    other
                )))
            }
        }

        let mut settings = CodecSettings::default();
        if let Some(options) = &cm_config.http_protocol_options {
            if let Some(v) = options.allow_absolute_url {
                settings.allow_absolute_url = v;
            }
            if let Some(v) = options.accept_http_10 {
                settings.accept_http_10 = v;
            }
            if let Some(v) = options.allow_chunked_length {
                settings.allow_chunked_length = v;
            }
            if let Some(v) = options.stream_error_on_invalid_http_message {
                settings.stream_error_on_invalid_http_message = v;
            }
            if let Some(v) = options.enable_trailers {
                settings.enable_trailers = v;
            }
        }
        if let Some(kb) = cm_config.max_request_headers_kb {
            settings.max_headers_kb = kb;
        }
        if let Some(count) = cm_config.max_request_headers_count {
            settings.max_headers_count = count;
        }

        let cluster_manager = ClusterManager::new(settings.clone());
        let mut dfp: Option<(Arc<DfpCluster>, Arc<DfpWorkerState>)> = None;

        for cluster in self.clusters.unwrap_or_default() {
            let name = cluster
                .name
                .clone()
                .ok_or_else(|| invalid("cluster requires a name"))?;
            let discovery = match cluster.discovery.as_deref().unwrap_or("static") {
                "static" => DiscoveryType::Static,
                "strict_dns" => DiscoveryType::StrictDns,
                "logical_dns" => DiscoveryType::LogicalDns,
                "dynamic_forward_proxy" => DiscoveryType::DynamicForwardProxy,
                other => return Err(invalid(format!("unknown discovery type {:?}", other))),
            };
            if let Some(policy) = cluster.lb_policy.as_deref() {
                if policy != "round_robin" {
                    return Err(invalid(format!("unknown lb policy {:?}", policy)));
                }
            }

            let mut limits = ResourceLimits::default();
            if let Some(v) = cluster.max_connections {
                limits.max_connections = v;
            }
            if let Some(v) = cluster.max_pending_requests {
                limits.max_pending_requests = v;
            }
            if let Some(v) = cluster.max_requests {
                limits.max_requests = v;
            }

            let mut info = ClusterInfo::new(name.clone(), discovery).with_limits(limits);
            if let Some(secs) = cluster.connect_timeout {
                info.connect_timeout = Duration::from_secs(secs);
            }
            if let Some(v) = cluster.max_requests_per_connection {
                info.max_requests_per_connection = v;
            }

            if discovery == DiscoveryType::DynamicForwardProxy {
                if dfp.is_some() {
                    return Err(invalid("only one dynamic_forward_proxy cluster"));
                }
                let store = DfpClusterStore::new();
                let worker = DfpWorkerState::new();
                cluster_manager.add_update_listener(worker.clone());
                let (dfp_cluster, _main_task) = DfpCluster::new(
                    cluster_manager.clone(),
                    store.clone(),
                    Duration::from_secs(300),
                );
                let _reaper = dfp_cluster.spawn_reaper(cluster_manager.clone(), Duration::from_secs(60));
                let lb = DfpLoadBalancer::new(&cluster_manager, store, true);
                cluster_manager.add_or_update_cluster_with_lb(
                    Arc::new(info),
                    Vec::new(),
                    Some(lb),
                );
                dfp = Some((dfp_cluster, worker));
                continue;
            }

            let endpoints = cluster
                .lb_endpoints
                .as_deref()
                .filter(|endpoints| !endpoints.is_empty())
                .ok_or_else(|| invalid(format!("cluster {:?} has no endpoints", name)))?;
            let mut hosts = Vec::with_capacity(endpoints.len());
            for endpoint in endpoints {
                let (address, port) = endpoint
                    .rsplit_once(':')
                    .and_then(|(address, port)| {
                        port.parse::<u16>().ok().map(|port| (address, port))
                    })
                    .ok_or_else(|| {
                        invalid(format!("endpoint {:?} is not host:port", endpoint))
                    })?;
                hosts.push(Host::new(name.clone(), address, port));
            }
            cluster_manager.add_or_update_cluster(Arc::new(info), hosts);
        }

        let mut routes = Vec::new();
        for route in self.routes.unwrap_or_default() {
            let name = route.name.clone().unwrap_or_else(|| "route".to_string());
            let mut methods = Vec::new();
            for method in route.methods.unwrap_or_default() {
                let method = Method::from_bytes(method.to_ascii_uppercase().as_bytes())
                    .map_err(|_| invalid(format!("bad method in route {:?}", name)))?;
                methods.push(method);
            }
            let rule = RouteMatch {
                methods,
                host: route.host,
                path_prefix: route.prefix.unwrap_or_else(|| "/".to_string()),
                headers: Vec::new(),
            };
            let action = match (route.cluster, route.direct_status) {
                (Some(cluster), None) => {
                    let mut entry = RouteEntry::to_cluster(cluster);
                    entry.prefix_rewrite = route.prefix_rewrite;
                    entry.host_rewrite = route.host_rewrite;
                    entry.request_headers_to_add = route
                        .request_headers_to_add
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    entry.request_headers_to_remove =
                        route.request_headers_to_remove.unwrap_or_default();
                    entry.response_headers_to_add = route
                        .response_headers_to_add
                        .unwrap_or_default()
                        .into_iter()
                        .collect();
                    entry.response_headers_to_remove =
                        route.response_headers_to_remove.unwrap_or_default();
                    RouteAction::Cluster(entry)
                }
                (None, Some(status)) => {
                    let code = StatusCode::from_u16(status)
                        .map_err(|_| invalid(format!("bad status in route {:?}", name)))?;
                    RouteAction::Direct(DirectResponse {
                        code,
                        body: route.direct_body.map(Into::into),
                    })
                }
                _ => {
                    return Err(invalid(format!(
                        "route {:?} needs exactly one of cluster or direct_status",
                        name
                    )))
                }
            };
            routes.push(Arc::new(Route { name, rule, action }));
        }
        let routes = Arc::new(ArcSwap::from_pointee(RouteConfig {
            name: "routes".into(),
            routes,
        }));

        let mut factory = ProxyFilterChain::new(cluster_manager.clone(), routes.clone());
        if let Some((dfp_cluster, worker)) = dfp {
            factory = factory.with_dynamic_forward_proxy(dfp_cluster, worker);
        }

        let hcm = Arc::new(HcmConfig {
            settings,
            filter_factory: Arc::new(factory),
            local_reply: Arc::new(DefaultLocalReply),
            max_requests_per_connection: cm_config.max_requests_per_connection.unwrap_or(0),
            buffer_limit: cm_config.buffer_limit_bytes.unwrap_or(1024 * 1024),
            force_reset_on_premature_upstream_half_close: cm_config
                .force_reset_on_premature_upstream_half_close
                .unwrap_or(false),
            proxy_100_continue: cm_config.proxy_100_continue.unwrap_or(false),
        });

        let mut server = Server::new(hcm);
        if self.listeners.is_empty() {
            return Err(invalid("at least one listener required"));
        }
        for listener in self.listeners {
            match (listener.address, listener.unix_path) {
                (Some(address), None) => server.add_listener(ListenerAddress::Tcp(address)),
                (None, Some(path)) => server.add_listener(ListenerAddress::Unix(path)),
                _ => {
                    return Err(invalid(
                        "listener needs exactly one of address or unix_path",
                    ))
                }
            }
        }

        Ok(BuiltProxy {
            server,
            cluster_manager,
            routes,
        })
    }
}
