//! byte-level proxy scenarios over in-memory connections

use std::io;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::BoxFuture;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use voulge::cluster::info::{ClusterInfo, DiscoveryType, Host};
use voulge::cluster::manager::{ClusterManager, ConnectorFactory};
use voulge::cluster::resource::ResourceLimits;
use voulge::conn::manager::HcmConfig;
use voulge::dfp::cluster::{DfpCluster, DfpWorkerState};
use voulge::dfp::lb::DfpLoadBalancer;
use voulge::dfp::store::DfpClusterStore;
use voulge::dfp::sub_cluster_name;
use voulge::filter::local_reply::DefaultLocalReply;
use voulge::net::transport::Connect;
use voulge::net::Stream;
use voulge::proto::CodecSettings;
use voulge::router::route::{Route, RouteAction, RouteConfig, RouteEntry, RouteMatch};
use voulge::server::{serve_connection, ProxyFilterChain};

/// hands out duplex pipes instead of sockets; the server halves queue up
struct PipeConnector {
    servers: Arc<StdMutex<Vec<DuplexStream>>>,
}

impl Connect for PipeConnector {
    fn connect(&self) -> BoxFuture<'static, io::Result<Stream>> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        self.servers.lock().unwrap().push(server);
        Box::pin(async move { Ok(Box::new(client) as Stream) })
    }
}

struct PipeFactory {
    servers: Arc<StdMutex<Vec<DuplexStream>>>,
}

impl ConnectorFactory for PipeFactory {
    fn connector(&self, _host: &Host) -> Arc<dyn Connect> {
        Arc::new(PipeConnector {
            servers: self.servers.clone(),
        })
    }
}

struct Fixture {
    cluster_manager: Arc<ClusterManager>,
    routes: Arc<ArcSwap<RouteConfig>>,
    upstream_servers: Arc<StdMutex<Vec<DuplexStream>>>,
}

impl Fixture {
    fn new(limits: ResourceLimits) -> Self {
        let servers: Arc<StdMutex<Vec<DuplexStream>>> = Arc::default();
        let cluster_manager = ClusterManager::with_connector_factory(
            CodecSettings::default(),
            Arc::new(PipeFactory {
                servers: servers.clone(),
            }),
        );
        cluster_manager.add_or_update_cluster(
            Arc::new(ClusterInfo::new("api", DiscoveryType::Static).with_limits(limits)),
            vec![Host::new("api", "10.0.0.1", 8080)],
        );
        let routes = Arc::new(ArcSwap::from_pointee(RouteConfig {
            name: "e2e".into(),
            routes: vec![Arc::new(Route {
                name: "all".into(),
                rule: RouteMatch::prefix("/"),
                action: RouteAction::Cluster(RouteEntry::to_cluster("api")),
            })],
        }));
        Fixture {
            cluster_manager,
            routes,
            upstream_servers: servers,
        }
    }

    fn hcm(&self, force_reset: bool) -> Arc<HcmConfig> {
        Arc::new(HcmConfig {
            settings: CodecSettings::default(),
            filter_factory: Arc::new(ProxyFilterChain::new(
                self.cluster_manager.clone(),
                self.routes.clone(),
            )),
            local_reply: Arc::new(DefaultLocalReply),
            max_requests_per_connection: 0,
            buffer_limit: 1024 * 1024,
            force_reset_on_premature_upstream_half_close: force_reset,
            proxy_100_continue: true,
        })
    }

    /// open a downstream connection against the proxy
    fn connect_downstream(&self, config: Arc<HcmConfig>) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(serve_connection(config, Box::new(server) as Stream));
        client
    }

    async fn take_upstream(&self) -> DuplexStream {
        for _ in 0..2000 {
            if let Some(server) = self.upstream_servers.lock().unwrap().pop() {
                return server;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("no upstream connection arrived");
    }
}

async fn read_head(stream: &mut DuplexStream) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(n > 0, "peer closed while reading head: {:?}", String::from_utf8_lossy(&collected));
        collected.extend_from_slice(&chunk[..n]);
        if collected.windows(4).any(|w| w == b"\r\n\r\n") {
            return collected;
        }
    }
}

async fn read_until(stream: &mut DuplexStream, needle: &[u8]) -> Vec<u8> {
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        let n = stream.read(&mut chunk).await.expect("read");
        assert!(n > 0, "peer closed early: {:?}", String::from_utf8_lossy(&collected));
        collected.extend_from_slice(&chunk[..n]);
        if collected
            .windows(needle.len())
            .any(|window| window == needle)
        {
            return collected;
        }
    }
}

#[tokio::test]
async fn simple_get_keep_alive() {
    let fixture = Fixture::new(ResourceLimits::default());
    let mut downstream = fixture.connect_downstream(fixture.hcm(false));

    downstream
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let mut upstream = fixture.take_upstream().await;
    let request = read_head(&mut upstream).await;
    let request = String::from_utf8(request).unwrap();
    assert!(request.starts_with("GET / HTTP/1.1\r\n"));
    assert!(request.contains("Host: a\r\n"));
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();

    let response = String::from_utf8(read_head(&mut downstream).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Content-Length: 0\r\n"));

    // the connection survives for a second exchange
    downstream
        .write_all(b"GET /second HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let mut upstream = fixture.take_upstream().await;
    let request = String::from_utf8(read_head(&mut upstream).await).unwrap();
    assert!(request.starts_with("GET /second HTTP/1.1\r\n"));
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut downstream).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn chunked_post_streams_both_ways() {
    let fixture = Fixture::new(ResourceLimits::default());
    let mut downstream = fixture.connect_downstream(fixture.hcm(false));

    downstream
        .write_all(
            b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let mut upstream = fixture.take_upstream().await;
    let request = String::from_utf8(read_until(&mut upstream, b"0\r\n\r\n").await).unwrap();
    assert!(request.starts_with("POST /x HTTP/1.1\r\n"));
    assert!(request.contains("Transfer-Encoding: chunked\r\n"));
    assert!(request.contains("5\r\nhello\r\n"));

    upstream
        .write_all(
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nworld\r\n0\r\n\r\n",
        )
        .await
        .unwrap();

    let response = String::from_utf8(read_until(&mut downstream, b"0\r\n\r\n").await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(response.contains("Transfer-Encoding: chunked\r\n"));
    assert!(response.contains("5\r\nworld\r\n"));
    // exactly one terminating chunk
    assert_eq!(response.matches("0\r\n\r\n").count(), 1);
}

#[tokio::test]
async fn absolute_form_url_sets_host() {
    let fixture = Fixture::new(ResourceLimits::default());
    let mut downstream = fixture.connect_downstream(fixture.hcm(false));

    downstream
        .write_all(b"GET http://upstream.example/foo?a=1 HTTP/1.1\r\nHost: ignored\r\n\r\n")
        .await
        .unwrap();

    let mut upstream = fixture.take_upstream().await;
    let request = String::from_utf8(read_head(&mut upstream).await).unwrap();
    assert!(request.starts_with("GET /foo?a=1 HTTP/1.1\r\n"));
    assert!(request.contains("Host: upstream.example\r\n"));
    assert!(!request.contains("ignored"));
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut downstream).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn route_miss_is_404() {
    let fixture = Fixture::new(ResourceLimits::default());
    // narrow the route table so the request misses
    fixture.routes.store(Arc::new(RouteConfig {
        name: "narrow".into(),
        routes: vec![Arc::new(Route {
            name: "only-api".into(),
            rule: RouteMatch::prefix("/api"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("api")),
        })],
    }));
    let mut downstream = fixture.connect_downstream(fixture.hcm(false));

    downstream
        .write_all(b"GET /other HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_until(&mut downstream, b"Not Found").await).unwrap();
    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
}

#[tokio::test]
async fn pool_overflow_is_503() {
    let fixture = Fixture::new(ResourceLimits {
        max_connections: 1,
        max_pending_requests: 1,
        ..Default::default()
    });
    let config = fixture.hcm(false);

    // first exchange occupies the single connection
    let mut first = fixture.connect_downstream(config.clone());
    first
        .write_all(b"GET /1 HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let mut upstream = fixture.take_upstream().await;
    let _ = read_head(&mut upstream).await;

    // second parks in the single pending slot
    let mut second = fixture.connect_downstream(config.clone());
    second
        .write_all(b"GET /2 HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // third finds every budget spent
    let mut third = fixture.connect_downstream(config);
    third
        .write_all(b"GET /3 HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let response =
        String::from_utf8(read_until(&mut third, b"no healthy upstream").await).unwrap();
    assert!(response.starts_with("HTTP/1.1 503 Service Unavailable\r\n"));

    // the busy exchange still completes
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut first).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    // the parked one reuses the freed client on the same pipe
    let request = String::from_utf8(read_head(&mut upstream).await).unwrap();
    assert!(request.starts_with("GET /2 HTTP/1.1\r\n"));
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut second).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn premature_upstream_close_cuts_downstream() {
    let fixture = Fixture::new(ResourceLimits::default());
    let mut downstream = fixture.connect_downstream(fixture.hcm(true));

    downstream
        .write_all(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
        .await
        .unwrap();

    let mut upstream = fixture.take_upstream().await;
    let _ = read_head(&mut upstream).await;
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello")
        .await
        .unwrap();
    drop(upstream);

    // headers and the partial body stream through, then the proxy resets
    let mut collected = Vec::new();
    let mut chunk = [0u8; 4096];
    loop {
        match downstream.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => collected.extend_from_slice(&chunk[..n]),
        }
    }
    let text = String::from_utf8_lossy(&collected);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.contains("hello"));
    // the advertised ten bytes never completed
    assert!(!text.contains("hellohello"));
}

#[tokio::test]
async fn dfp_cold_then_warm() {
    let servers: Arc<StdMutex<Vec<DuplexStream>>> = Arc::default();
    let cluster_manager = ClusterManager::with_connector_factory(
        CodecSettings::default(),
        Arc::new(PipeFactory {
            servers: servers.clone(),
        }),
    );
    let store = DfpClusterStore::new();
    let worker = DfpWorkerState::new();
    cluster_manager.add_update_listener(worker.clone());
    let (dfp, _main_task) = DfpCluster::new(
        cluster_manager.clone(),
        store.clone(),
        Duration::from_secs(300),
    );
    let lb = DfpLoadBalancer::new(&cluster_manager, store, true);
    cluster_manager.add_or_update_cluster_with_lb(
        Arc::new(ClusterInfo::new(
            "dynamic",
            DiscoveryType::DynamicForwardProxy,
        )),
        Vec::new(),
        Some(lb),
    );
    let routes = Arc::new(ArcSwap::from_pointee(RouteConfig {
        name: "dfp".into(),
        routes: vec![Arc::new(Route {
            name: "all".into(),
            rule: RouteMatch::prefix("/"),
            action: RouteAction::Cluster(RouteEntry::to_cluster("dynamic")),
        })],
    }));
    let config = Arc::new(HcmConfig {
        settings: CodecSettings::default(),
        filter_factory: Arc::new(
            ProxyFilterChain::new(cluster_manager.clone(), routes)
                .with_dynamic_forward_proxy(dfp.clone(), worker),
        ),
        local_reply: Arc::new(DefaultLocalReply),
        max_requests_per_connection: 0,
        buffer_limit: 1024 * 1024,
        force_reset_on_premature_upstream_half_close: false,
        proxy_100_continue: true,
    });

    let (mut downstream, server_half) = tokio::io::duplex(64 * 1024);
    tokio::spawn(serve_connection(config, Box::new(server_half) as Stream));

    // cold: the sub-cluster does not exist yet
    assert!(cluster_manager
        .get(&sub_cluster_name("x.test", 80))
        .is_none());
    downstream
        .write_all(b"GET / HTTP/1.1\r\nHost: x.test\r\n\r\n")
        .await
        .unwrap();

    let mut upstream = {
        let servers = servers.clone();
        loop {
            if let Some(server) = servers.lock().unwrap().pop() {
                break server;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    };
    let request = String::from_utf8(read_head(&mut upstream).await).unwrap();
    assert!(request.contains("Host: x.test\r\n"));
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut downstream).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));

    // the sub-cluster now exists and is touchable
    assert!(cluster_manager
        .get(&sub_cluster_name("x.test", 80))
        .is_some());
    assert!(dfp.touch(&sub_cluster_name("x.test", 80)));

    // warm: second request proceeds without a fresh cluster load and
    // rides the pooled client
    downstream
        .write_all(b"GET /again HTTP/1.1\r\nHost: x.test\r\n\r\n")
        .await
        .unwrap();
    let request = String::from_utf8(read_head(&mut upstream).await).unwrap();
    assert!(request.starts_with("GET /again HTTP/1.1\r\n"));
    upstream
        .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut downstream).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
}

#[tokio::test]
async fn http10_request_rejected_by_default() {
    let fixture = Fixture::new(ResourceLimits::default());
    let mut downstream = fixture.connect_downstream(fixture.hcm(false));
    downstream
        .write_all(b"GET / HTTP/1.0\r\nHost: a\r\n\r\n")
        .await
        .unwrap();
    let response = String::from_utf8(read_head(&mut downstream).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
}
