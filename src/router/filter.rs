use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use http::StatusCode;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::cluster::info::Host;
use crate::cluster::lb::LbContext;
use crate::cluster::manager::{ClusterManager, ThreadLocalCluster};
use crate::cluster::ResourcePriority;
use crate::error::{ResponseFlag, StreamResetReason};
use crate::filter::local_reply::LocalReply;
use crate::filter::{
    DecoderFilter, FilterCallbacks, FilterDataStatus, FilterHeadersStatus, FilterTrailersStatus,
};
use crate::headers::HeaderMap;
use crate::router::route::{Route, RouteConfig};

/// everything the upstream side needs to start one request
pub struct UpstreamIntent {
    pub cluster: Arc<ThreadLocalCluster>,
    pub host: Arc<Host>,
    pub route: Arc<Route>,
    pub headers: HeaderMap,
    pub end_stream: bool,
    pub priority: ResourcePriority,
}

/// request body flowing from the decoder chain to the upstream task
pub enum RequestBodyEvent {
    Data(Bytes, bool),
    Trailers(HeaderMap),
}

/// a host selection that had to go async
pub struct PendingSelection {
    pub cluster: Arc<ThreadLocalCluster>,
    pub route: Arc<Route>,
    pub headers: HeaderMap,
    pub end_stream: bool,
    pub rx: oneshot::Receiver<Option<Arc<Host>>>,
}

/// shared ledger between the router filter and the stream's driver
#[derive(Default)]
pub struct RouterExchange {
    pub intent: Option<UpstreamIntent>,
    /// survives the intent handoff; response mutations read it
    pub route: Option<Arc<Route>>,
    pub pending_selection: Option<PendingSelection>,
    pub body_tx: Option<mpsc::UnboundedSender<RequestBodyEvent>>,
    pub body_rx: Option<mpsc::UnboundedReceiver<RequestBodyEvent>>,
    pub request_complete: bool,
    pub response_started: bool,
    /// the upstream request went away; trailing request data is an error
    pub upstream_gone: bool,
}

/// the terminal decoder filter: turns a decoded request into upstream work
///
/// all verdicts are `StopIteration*`: nothing sits behind the router, the
/// response comes back through the encoder chain.
pub struct RouterFilter {
    cluster_manager: Arc<ClusterManager>,
    routes: Arc<ArcSwap<RouteConfig>>,
    exchange: Arc<Mutex<RouterExchange>>,
}

impl RouterFilter {
    pub fn new(
        cluster_manager: Arc<ClusterManager>,
        routes: Arc<ArcSwap<RouteConfig>>,
        exchange: Arc<Mutex<RouterExchange>>,
    ) -> Self {
        RouterFilter {
            cluster_manager,
            routes,
            exchange,
        }
    }

    fn stage_upstream(
        exchange: &mut RouterExchange,
        cluster: Arc<ThreadLocalCluster>,
        route: Arc<Route>,
        mut headers: HeaderMap,
        end_stream: bool,
        host: Arc<Host>,
    ) {
        let entry = route.entry().expect("cluster route");
        entry.finalize_request_headers(&mut headers, &route.rule.path_prefix);
        if headers.scheme().is_none() {
            let scheme = if cluster.info().transport.implements_secure_transport() {
                crate::headers::values::SCHEME_HTTPS
            } else {
                crate::headers::values::SCHEME_HTTP
            };
            headers.set_scheme(scheme);
        }
        if !end_stream {
            let (tx, rx) = mpsc::unbounded_channel();
            exchange.body_tx = Some(tx);
            exchange.body_rx = Some(rx);
        }
        exchange.request_complete = end_stream;
        exchange.route = Some(route.clone());
        exchange.intent = Some(UpstreamIntent {
            priority: entry.priority,
            cluster,
            host,
            route,
            headers,
            end_stream,
        });
    }

    /// finish an async host selection: build the intent or report why not
    pub fn complete_selection(
        exchange: &Arc<Mutex<RouterExchange>>,
        host: Option<Arc<Host>>,
    ) -> Result<(), LocalReply> {
        let mut guard = exchange.lock();
        let Some(pending) = guard.pending_selection.take() else {
            return Ok(());
        };
        match host {
            Some(host) => {
                RouterFilter::stage_upstream(
                    &mut guard,
                    pending.cluster,
                    pending.route,
                    pending.headers,
                    pending.end_stream,
                    host,
                );
                Ok(())
            }
            None => Err(LocalReply::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_healthy_upstream",
            )),
        }
    }
}

impl DecoderFilter for RouterFilter {
    fn decode_headers(
        &mut self,
        headers: &mut HeaderMap,
        end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        let route = match self.routes.load().find(headers) {
            Some(route) => route,
            None => {
                tracing::debug!(
                    path = headers.path().unwrap_or(""),
                    "no route match for request"
                );
                callbacks.set_response_flag(ResponseFlag::NoRouteFound);
                callbacks.send_local_reply(LocalReply::new(
                    StatusCode::NOT_FOUND,
                    "route_not_found",
                ));
                return FilterHeadersStatus::StopIteration;
            }
        };
        callbacks.stream_info().route = Some(route.clone());

        if let Some(direct) = route.direct_response() {
            let mut reply = LocalReply::new(direct.code, "direct_response");
            if let Some(body) = &direct.body {
                reply = reply.with_body(body.clone());
            }
            callbacks.send_local_reply(reply);
            return FilterHeadersStatus::StopIteration;
        }

        let entry = route.entry().expect("not a direct response");
        let cluster = match self.cluster_manager.get(&entry.cluster_name) {
            Some(cluster) => cluster,
            None => {
                tracing::debug!(cluster = %entry.cluster_name, "unknown cluster");
                callbacks.set_response_flag(ResponseFlag::NoClusterFound);
                callbacks.send_local_reply(LocalReply::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "cluster_not_found",
                ));
                return FilterHeadersStatus::StopIteration;
            }
        };
        callbacks.stream_info().cluster_name = Some(entry.cluster_name.clone());

        let selection = {
            let info = callbacks.stream_info();
            let ctx = LbContext {
                headers: Some(headers),
                filter_state: Some(&info.filter_state),
                downstream_server_name: info.requested_server_name.as_deref(),
            };
            cluster.choose_host(&ctx)
        };

        let mut exchange = self.exchange.lock();
        if let Some(host) = selection.host {
            RouterFilter::stage_upstream(
                &mut exchange,
                cluster,
                route,
                headers.clone(),
                end_stream,
                host,
            );
            // terminal filter: nothing sits behind the router, so the
            // chain ends here and body callbacks keep flowing in
            FilterHeadersStatus::Continue
        } else if let Some(rx) = selection.pending {
            exchange.pending_selection = Some(PendingSelection {
                cluster,
                route,
                headers: headers.clone(),
                end_stream,
                rx,
            });
            FilterHeadersStatus::StopIteration
        } else {
            drop(exchange);
            tracing::debug!(details = selection.details, "host selection failed");
            callbacks.send_local_reply(LocalReply::new(
                StatusCode::SERVICE_UNAVAILABLE,
                "no_healthy_upstream",
            ));
            FilterHeadersStatus::StopIteration
        }
    }

    fn decode_data(
        &mut self,
        data: &mut Bytes,
        end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterDataStatus {
        let mut exchange = self.exchange.lock();
        if end_stream {
            exchange.request_complete = true;
        }
        if exchange.upstream_gone {
            drop(exchange);
            callbacks.send_local_reply(
                LocalReply::new(StatusCode::SERVICE_UNAVAILABLE, "early_upstream_reset")
                    .with_body("upstream is closed prematurely during decoding data from downstream"),
            );
            return FilterDataStatus::StopIterationNoBuffer;
        }
        if let Some(tx) = &exchange.body_tx {
            let _ = tx.send(RequestBodyEvent::Data(std::mem::take(data), end_stream));
        }
        FilterDataStatus::StopIterationNoBuffer
    }

    fn decode_trailers(
        &mut self,
        trailers: &mut HeaderMap,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterTrailersStatus {
        let mut exchange = self.exchange.lock();
        exchange.request_complete = true;
        if let Some(tx) = &exchange.body_tx {
            let _ = tx.send(RequestBodyEvent::Trailers(trailers.clone()));
        }
        FilterTrailersStatus::StopIteration
    }

    fn decode_complete(&mut self, _callbacks: &mut dyn FilterCallbacks) {
        self.exchange.lock().request_complete = true;
    }
}

/// response-code detail the router attaches for an upstream reset
pub fn reset_details(reason: StreamResetReason) -> &'static str {
    match reason {
        StreamResetReason::Overflow => "overflow",
        StreamResetReason::Http1PrematureUpstreamHalfClose => "early_upstream_reset",
        StreamResetReason::ProtocolError => "upstream_protocol_error",
        StreamResetReason::ConnectionTermination => "upstream_connection_termination",
        StreamResetReason::ConnectionTimeout => "upstream_connect_timeout",
        StreamResetReason::LocalConnectionFailure
        | StreamResetReason::RemoteConnectionFailure
        | StreamResetReason::ConnectError => "upstream_connect_failure",
        _ => "upstream_reset",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::info::{ClusterInfo, DiscoveryType};
    use crate::conn::info::StreamInfo;
    use crate::filter::local_reply::DefaultLocalReply;
    use crate::filter::manager::{EncodeSink, FilterChainBuilder, FilterManager};
    use crate::filter::state::ConnectionState;
    use crate::proto::CodecSettings;
    use crate::router::route::{DirectResponse, RouteAction, RouteEntry, RouteMatch};

    #[derive(Default)]
    struct CaptureSink {
        status: Option<StatusCode>,
        body: Vec<u8>,
    }

    impl EncodeSink for CaptureSink {
        fn encode_1xx_headers(&mut self, _headers: &HeaderMap) {}
        fn encode_headers(&mut self, headers: &HeaderMap, _end_stream: bool) {
            self.status = headers.status();
        }
        fn encode_data(&mut self, data: Bytes, _end_stream: bool) {
            self.body.extend_from_slice(&data);
        }
        fn encode_trailers(&mut self, _trailers: &HeaderMap) {}
    }

    fn routes(routes: Vec<Route>) -> Arc<ArcSwap<RouteConfig>> {
        Arc::new(ArcSwap::from_pointee(RouteConfig {
            name: "test".into(),
            routes: routes.into_iter().map(Arc::new).collect(),
        }))
    }

    fn request(path: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.set_method(&http::Method::GET);
        headers.set_path(path);
        headers.set_host("downstream.example");
        headers
    }

    fn build(
        cm: Arc<ClusterManager>,
        table: Arc<ArcSwap<RouteConfig>>,
    ) -> (FilterManager, Arc<Mutex<RouterExchange>>) {
        let exchange = Arc::new(Mutex::new(RouterExchange::default()));
        let mut chain = FilterChainBuilder::new();
        chain.add_decoder_filter(Box::new(RouterFilter::new(cm, table, exchange.clone())));
        let fm = FilterManager::new(
            chain,
            StreamInfo::new(1, ConnectionState::default()),
            Arc::new(DefaultLocalReply),
        );
        (fm, exchange)
    }

    #[test]
    fn missing_route_is_404() {
        let cm = ClusterManager::new(CodecSettings::default());
        let (mut fm, _exchange) = build(cm, routes(vec![]));
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/"), true, &mut sink);
        assert_eq!(sink.status, Some(StatusCode::NOT_FOUND));
        assert!(fm.info().has_response_flag(ResponseFlag::NoRouteFound));
        assert_eq!(
            fm.info().response_code_details.as_deref(),
            Some("route_not_found")
        );
    }

    #[test]
    fn missing_cluster_is_503() {
        let cm = ClusterManager::new(CodecSettings::default());
        let table = routes(vec![Route {
            name: "r".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("ghost")),
        }]);
        let (mut fm, _exchange) = build(cm, table);
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/"), true, &mut sink);
        assert_eq!(sink.status, Some(StatusCode::SERVICE_UNAVAILABLE));
        assert!(fm.info().has_response_flag(ResponseFlag::NoClusterFound));
        assert_eq!(
            fm.info().response_code_details.as_deref(),
            Some("cluster_not_found")
        );
    }

    #[test]
    fn no_hosts_is_no_healthy_upstream() {
        let cm = ClusterManager::new(CodecSettings::default());
        cm.add_or_update_cluster(
            Arc::new(ClusterInfo::new("empty", DiscoveryType::Static)),
            Vec::new(),
        );
        let table = routes(vec![Route {
            name: "r".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("empty")),
        }]);
        let (mut fm, _exchange) = build(cm, table);
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/"), true, &mut sink);
        assert_eq!(sink.status, Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(sink.body, b"no healthy upstream");
    }

    #[test]
    fn direct_response_route_answers() {
        let cm = ClusterManager::new(CodecSettings::default());
        let table = routes(vec![Route {
            name: "teapot".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Direct(DirectResponse {
                code: StatusCode::IM_A_TEAPOT,
                body: Some(Bytes::from_static(b"short and stout")),
            }),
        }]);
        let (mut fm, _exchange) = build(cm, table);
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/"), true, &mut sink);
        assert_eq!(sink.status, Some(StatusCode::IM_A_TEAPOT));
        assert_eq!(sink.body, b"short and stout");
    }

    #[test]
    fn staged_intent_carries_finalized_headers() {
        let cm = ClusterManager::new(CodecSettings::default());
        cm.add_or_update_cluster(
            Arc::new(ClusterInfo::new("api", DiscoveryType::Static)),
            vec![crate::cluster::info::Host::new("api", "10.0.0.1", 8080)],
        );
        let mut entry = RouteEntry::to_cluster("api");
        entry.prefix_rewrite = Some("/internal".into());
        entry.host_rewrite = Some("api.internal".into());
        let table = routes(vec![Route {
            name: "api".into(),
            rule: RouteMatch::prefix("/api"),
            action: RouteAction::Cluster(entry),
        }]);
        let (mut fm, exchange) = build(cm, table);
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/api/users"), true, &mut sink);

        let guard = exchange.lock();
        let intent = guard.intent.as_ref().expect("intent staged");
        assert_eq!(intent.host.endpoint(), "10.0.0.1:8080");
        assert_eq!(intent.headers.path(), Some("/internal/users"));
        assert_eq!(intent.headers.host(), Some("api.internal"));
        assert_eq!(intent.headers.scheme(), Some("http"));
        assert!(intent.end_stream);
        assert!(guard.request_complete);
        assert_eq!(fm.info().cluster_name.as_deref(), Some("api"));
        // no reply went out
        assert!(sink.status.is_none());
    }

    #[test]
    fn body_flows_into_channel() {
        let cm = ClusterManager::new(CodecSettings::default());
        cm.add_or_update_cluster(
            Arc::new(ClusterInfo::new("api", DiscoveryType::Static)),
            vec![crate::cluster::info::Host::new("api", "10.0.0.1", 8080)],
        );
        let table = routes(vec![Route {
            name: "api".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("api")),
        }]);
        let (mut fm, exchange) = build(cm, table);
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/"), false, &mut sink);
        fm.decode_data(Bytes::from_static(b"hello"), true, &mut sink);

        let mut rx = exchange.lock().body_rx.take().expect("body channel");
        match rx.try_recv().expect("body event") {
            RequestBodyEvent::Data(data, true) => assert_eq!(&data[..], b"hello"),
            _ => panic!("unexpected event"),
        }
        assert!(exchange.lock().request_complete);
    }

    #[test]
    fn data_after_upstream_gone_is_early_reset() {
        let cm = ClusterManager::new(CodecSettings::default());
        cm.add_or_update_cluster(
            Arc::new(ClusterInfo::new("api", DiscoveryType::Static)),
            vec![crate::cluster::info::Host::new("api", "10.0.0.1", 8080)],
        );
        let table = routes(vec![Route {
            name: "api".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("api")),
        }]);
        let (mut fm, exchange) = build(cm, table);
        let mut sink = CaptureSink::default();
        fm.decode_headers(request("/"), false, &mut sink);
        exchange.lock().upstream_gone = true;
        fm.decode_data(Bytes::from_static(b"late"), false, &mut sink);
        assert_eq!(sink.status, Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(
            fm.info().response_code_details.as_deref(),
            Some("early_upstream_reset")
        );
    }

    #[tokio::test]
    async fn deferred_selection_completes_or_fails() {
        let cm = ClusterManager::new(CodecSettings::default());
        cm.add_or_update_cluster(
            Arc::new(ClusterInfo::new("api", DiscoveryType::Static)),
            vec![crate::cluster::info::Host::new("api", "10.0.0.1", 8080)],
        );
        let cluster = cm.get("api").unwrap();
        let route = Arc::new(Route {
            name: "api".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("api")),
        });

        // a selection parked on a waiter, resolved with a host
        let exchange = Arc::new(Mutex::new(RouterExchange::default()));
        let (_tx, rx) = tokio::sync::oneshot::channel();
        exchange.lock().pending_selection = Some(PendingSelection {
            cluster: cluster.clone(),
            route: route.clone(),
            headers: request("/"),
            end_stream: true,
            rx,
        });
        assert!(RouterFilter::complete_selection(
            &exchange,
            Some(crate::cluster::info::Host::new("api", "10.0.0.9", 80)),
        )
        .is_ok());
        assert_eq!(
            exchange.lock().intent.as_ref().unwrap().host.endpoint(),
            "10.0.0.9:80"
        );

        // and one resolved with nothing selectable
        let exchange = Arc::new(Mutex::new(RouterExchange::default()));
        let (_tx, rx) = tokio::sync::oneshot::channel::<Option<Arc<crate::cluster::info::Host>>>();
        exchange.lock().pending_selection = Some(PendingSelection {
            cluster,
            route,
            headers: request("/"),
            end_stream: true,
            rx,
        });
        let reply = RouterFilter::complete_selection(&exchange, None).unwrap_err();
        assert_eq!(reply.code, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(reply.details, "no_healthy_upstream");
    }

    #[test]
    fn reset_detail_mapping() {
        assert_eq!(reset_details(StreamResetReason::Overflow), "overflow");
        assert_eq!(
            reset_details(StreamResetReason::Http1PrematureUpstreamHalfClose),
            "early_upstream_reset"
        );
        assert_eq!(
            reset_details(StreamResetReason::ProtocolError),
            "upstream_protocol_error"
        );
    }
}
