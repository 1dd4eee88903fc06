use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Method, StatusCode};

use crate::cluster::ResourcePriority;
use crate::headers::{values, HeaderMap};

/// request matching half of a route
#[derive(Debug, Clone, Default)]
pub struct RouteMatch {
    /// accepted methods, empty means any
    pub methods: Vec<Method>,
    /// exact host (port ignored), none means any
    pub host: Option<String>,
    /// path prefix the target must start with
    pub path_prefix: String,
    /// headers that must be present with these exact values
    pub headers: Vec<(String, String)>,
}

impl RouteMatch {
    pub fn prefix(prefix: impl Into<String>) -> Self {
        RouteMatch {
            path_prefix: prefix.into(),
            ..Default::default()
        }
    }

    fn matches(&self, headers: &HeaderMap) -> bool {
        if !self.methods.is_empty() {
            match headers.method() {
                Some(method) if self.methods.contains(&method) => {}
                _ => return false,
            }
        }
        if let Some(expected) = &self.host {
            let host = headers.host().map(strip_port).unwrap_or("");
            if !host.eq_ignore_ascii_case(expected) {
                return false;
            }
        }
        if !self.path_prefix.is_empty() {
            let path = headers.path().unwrap_or("");
            let path = path.split('?').next().unwrap_or("");
            if !path.starts_with(&self.path_prefix) {
                return false;
            }
        }
        for (name, value) in &self.headers {
            match headers.get(name) {
                Some(actual) if actual == value.as_bytes() => {}
                _ => return false,
            }
        }
        true
    }
}

fn strip_port(host: &str) -> &str {
    host.rsplit_once(':')
        .map(|(h, port)| {
            if port.chars().all(|c| c.is_ascii_digit()) {
                h
            } else {
                host
            }
        })
        .unwrap_or(host)
}

/// forwarding target plus the mutations applied around it
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub cluster_name: String,
    pub priority: ResourcePriority,
    pub host_rewrite: Option<String>,
    pub prefix_rewrite: Option<String>,
    pub scheme_rewrite: Option<String>,
    pub request_headers_to_add: Vec<(String, String)>,
    pub request_headers_to_remove: Vec<String>,
    pub response_headers_to_add: Vec<(String, String)>,
    pub response_headers_to_remove: Vec<String>,
    pub timeout: Option<Duration>,
}

impl RouteEntry {
    pub fn to_cluster(cluster_name: impl Into<String>) -> Self {
        RouteEntry {
            cluster_name: cluster_name.into(),
            priority: ResourcePriority::Default,
            host_rewrite: None,
            prefix_rewrite: None,
            scheme_rewrite: None,
            request_headers_to_add: Vec::new(),
            request_headers_to_remove: Vec::new(),
            response_headers_to_add: Vec::new(),
            response_headers_to_remove: Vec::new(),
            timeout: None,
        }
    }

    /// apply the request-side mutations, `matched_prefix` drives the
    /// prefix rewrite
    pub fn finalize_request_headers(&self, headers: &mut HeaderMap, matched_prefix: &str) {
        if let Some(host) = &self.host_rewrite {
            headers.set_host(host);
        }
        if let Some(scheme) = &self.scheme_rewrite {
            headers.set_scheme(scheme);
        }
        if let Some(rewrite) = &self.prefix_rewrite {
            if let Some(path) = headers.path().map(str::to_string) {
                if let Some(rest) = path.strip_prefix(matched_prefix) {
                    headers.set_path(&format!("{}{}", rewrite, rest));
                }
            }
        }
        for name in &self.request_headers_to_remove {
            headers.remove(name);
        }
        for (name, value) in &self.request_headers_to_add {
            headers.append(name.clone(), value.clone());
        }
    }

    pub fn finalize_response_headers(&self, headers: &mut HeaderMap) {
        for name in &self.response_headers_to_remove {
            headers.remove(name);
        }
        for (name, value) in &self.response_headers_to_add {
            headers.append(name.clone(), value.clone());
        }
    }
}

/// answer without going upstream
#[derive(Debug, Clone)]
pub struct DirectResponse {
    pub code: StatusCode,
    pub body: Option<Bytes>,
}

#[derive(Debug, Clone)]
pub enum RouteAction {
    Cluster(RouteEntry),
    Direct(DirectResponse),
}

/// one immutable match+action rule
#[derive(Debug, Clone)]
pub struct Route {
    pub name: String,
    pub rule: RouteMatch,
    pub action: RouteAction,
}

impl Route {
    pub fn entry(&self) -> Option<&RouteEntry> {
        match &self.action {
            RouteAction::Cluster(entry) => Some(entry),
            RouteAction::Direct(_) => None,
        }
    }

    pub fn direct_response(&self) -> Option<&DirectResponse> {
        match &self.action {
            RouteAction::Direct(direct) => Some(direct),
            RouteAction::Cluster(_) => None,
        }
    }
}

/// an immutable snapshot of the route table, first match wins
#[derive(Debug, Clone, Default)]
pub struct RouteConfig {
    pub name: String,
    pub routes: Vec<Arc<Route>>,
}

impl RouteConfig {
    pub fn find(&self, headers: &HeaderMap) -> Option<Arc<Route>> {
        self.routes
            .iter()
            .find(|route| route.rule.matches(headers))
            .cloned()
    }
}
