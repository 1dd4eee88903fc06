use bytes::Bytes;
use http::Method;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

use crate::error::{CodecError, PoolFailureReason, StreamResetReason};
use crate::headers::HeaderMap;
use crate::http1::client::HalfCloseOutcome;
use crate::pool::client::ReadOutcome;
use crate::pool::http1::ClientLease;
use crate::proto::ResponseDecoder;
use crate::router::filter::{RequestBodyEvent, UpstreamIntent};

/// response-side events flowing back to the stream's driver
#[derive(Debug)]
pub enum UpstreamEvent {
    Response1xx(HeaderMap),
    ResponseHeaders(HeaderMap, bool),
    ResponseData(Bytes, bool),
    ResponseTrailers(HeaderMap),
    Reset(StreamResetReason),
    PoolFailure(PoolFailureReason, String),
}

/// forwards decoded response events and remembers completion
struct ForwardingDecoder {
    tx: UnboundedSender<UpstreamEvent>,
    complete: bool,
}

impl ResponseDecoder for ForwardingDecoder {
    fn decode_1xx_headers(&mut self, headers: HeaderMap) {
        let _ = self.tx.send(UpstreamEvent::Response1xx(headers));
    }
    fn decode_headers(&mut self, headers: HeaderMap, end_stream: bool) {
        self.complete |= end_stream;
        let _ = self
            .tx
            .send(UpstreamEvent::ResponseHeaders(headers, end_stream));
    }
    fn decode_data(&mut self, data: Bytes, end_stream: bool) {
        self.complete |= end_stream;
        let _ = self.tx.send(UpstreamEvent::ResponseData(data, end_stream));
    }
    fn decode_trailers(&mut self, trailers: HeaderMap) {
        self.complete = true;
        let _ = self.tx.send(UpstreamEvent::ResponseTrailers(trailers));
    }
}

/// one request bridged onto one pooled upstream client
pub struct UpstreamRequest {
    lease: Option<ClientLease>,
    request_sent: bool,
}

impl UpstreamRequest {
    /// pull a client out of the pool for this intent
    pub async fn acquire(
        intent: &UpstreamIntent,
        force_reset_on_premature_half_close: bool,
    ) -> Result<Self, (PoolFailureReason, String)> {
        let pool = intent.cluster.http_conn_pool(&intent.host, intent.priority);
        let mut lease = pool.new_stream().await?;
        lease
            .client_mut()
            .codec_client
            .codec
            .set_force_reset_on_premature_half_close(force_reset_on_premature_half_close);
        Ok(UpstreamRequest {
            lease: Some(lease),
            request_sent: false,
        })
    }

    fn lease_mut(&mut self) -> &mut ClientLease {
        self.lease.as_mut().expect("upstream request finished")
    }

    pub async fn accept_headers_from_router(
        &mut self,
        method: Method,
        headers: &HeaderMap,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let client = self.lease_mut().client_mut();
        client.codec_client.codec.new_stream(method)?;
        client
            .codec_client
            .codec
            .encode_request_headers(headers, end_stream)?;
        self.request_sent = end_stream;
        self.flush().await
    }

    pub async fn accept_data_from_router(
        &mut self,
        data: Bytes,
        end_stream: bool,
    ) -> Result<(), CodecError> {
        let client = self.lease_mut().client_mut();
        client.codec_client.codec.encode_request_data(data, end_stream)?;
        self.request_sent |= end_stream;
        self.flush().await
    }

    pub async fn accept_trailers_from_router(
        &mut self,
        trailers: &HeaderMap,
    ) -> Result<(), CodecError> {
        let client = self.lease_mut().client_mut();
        client.codec_client.codec.encode_request_trailers(trailers)?;
        self.request_sent = true;
        self.flush().await
    }

    async fn flush(&mut self) -> Result<(), CodecError> {
        self.lease_mut()
            .client_mut()
            .codec_client
            .flush()
            .await
            .map_err(|e| {
                tracing::debug!(error = %e, "upstream write failed");
                CodecError::Client("upstream-write-error")
            })
    }

    async fn read_step(
        &mut self,
        decoder: &mut ForwardingDecoder,
    ) -> Result<ReadOutcome, CodecError> {
        self.lease_mut()
            .client_mut()
            .codec_client
            .read_dispatch(decoder)
            .await
    }

    fn release(mut self, reuse: bool) {
        if let Some(lease) = self.lease.take() {
            lease.release(reuse);
        }
    }
}

/// drive one exchange: write the request, stream the body, read the
/// response; every outcome leaves exactly one terminal event (or a
/// complete response) on the channel
pub async fn run_upstream_request(
    intent: UpstreamIntent,
    body_rx: Option<UnboundedReceiver<RequestBodyEvent>>,
    events: UnboundedSender<UpstreamEvent>,
    force_reset_on_premature_half_close: bool,
) {
    let method = intent.headers.method().unwrap_or(Method::GET);
    let mut upstream =
        match UpstreamRequest::acquire(&intent, force_reset_on_premature_half_close).await {
            Ok(upstream) => upstream,
            Err((reason, message)) => {
                let _ = events.send(UpstreamEvent::PoolFailure(reason, message));
                return;
            }
        };
    tracing::debug!(
        host = %intent.host.endpoint(),
        cluster = %intent.cluster.info().name,
        "upstream request started"
    );

    if upstream
        .accept_headers_from_router(method, &intent.headers, intent.end_stream)
        .await
        .is_err()
    {
        let _ = events.send(UpstreamEvent::Reset(
            StreamResetReason::ConnectionTermination,
        ));
        upstream.release(false);
        return;
    }

    let mut decoder = ForwardingDecoder {
        tx: events.clone(),
        complete: false,
    };
    // route-level bound on the whole exchange
    let deadline = intent
        .route
        .entry()
        .and_then(|entry| entry.timeout)
        .map(|timeout| tokio::time::Instant::now() + timeout);
    let mut body_rx = body_rx;
    loop {
        let want_body = body_rx.is_some() && !upstream.request_sent;
        let outcome = tokio::select! {
            _ = async { tokio::time::sleep_until(deadline.expect("guarded")).await },
                if deadline.is_some() =>
            {
                tracing::debug!("upstream exchange timed out");
                let _ = events.send(UpstreamEvent::Reset(
                    StreamResetReason::ConnectionTimeout,
                ));
                upstream.release(false);
                return;
            }
            body = async { body_rx.as_mut().expect("guarded").recv().await }, if want_body => {
                match body {
                    Some(RequestBodyEvent::Data(data, end_stream)) => {
                        if upstream.accept_data_from_router(data, end_stream).await.is_err() {
                            let _ = events.send(UpstreamEvent::Reset(
                                StreamResetReason::ConnectionTermination,
                            ));
                            upstream.release(false);
                            return;
                        }
                    }
                    Some(RequestBodyEvent::Trailers(trailers)) => {
                        if upstream.accept_trailers_from_router(&trailers).await.is_err() {
                            let _ = events.send(UpstreamEvent::Reset(
                                StreamResetReason::ConnectionTermination,
                            ));
                            upstream.release(false);
                            return;
                        }
                    }
                    None => {
                        // downstream went away mid-request
                        upstream.release(false);
                        return;
                    }
                }
                continue;
            }
            outcome = upstream.read_step(&mut decoder) => outcome,
        };

        match outcome {
            Ok(ReadOutcome::Data) => {
                let premature = upstream
                    .lease_mut()
                    .client_mut()
                    .codec_client
                    .codec
                    .took_premature_half_close();
                if premature {
                    let _ = events.send(UpstreamEvent::Reset(
                        StreamResetReason::Http1PrematureUpstreamHalfClose,
                    ));
                    upstream.release(false);
                    return;
                }
                if decoder.complete {
                    let request_done = upstream.request_sent;
                    upstream.release(request_done);
                    return;
                }
            }
            Ok(ReadOutcome::RemoteClosed) => {
                let outcome = upstream
                    .lease_mut()
                    .client_mut()
                    .codec_client
                    .codec
                    .on_remote_close(&mut decoder);
                match outcome {
                    HalfCloseOutcome::ResponseComplete => {
                        // close-delimited response, connection is spent
                        upstream.release(false);
                    }
                    HalfCloseOutcome::Reset(reason) => {
                        let _ = events.send(UpstreamEvent::Reset(reason));
                        upstream.release(false);
                    }
                    HalfCloseOutcome::Idle => {
                        let _ = events.send(UpstreamEvent::Reset(
                            StreamResetReason::ConnectionTermination,
                        ));
                        upstream.release(false);
                    }
                }
                return;
            }
            Err(e) => {
                tracing::debug!(error = %e, "upstream response error");
                let _ = events.send(UpstreamEvent::Reset(StreamResetReason::ProtocolError));
                upstream.release(false);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::info::{ClusterInfo, DiscoveryType, Host};
    use crate::cluster::manager::{ClusterManager, ConnectorFactory};
    use crate::cluster::ResourcePriority;
    use crate::net::transport::Connect;
    use crate::proto::CodecSettings;
    use crate::router::route::{Route, RouteAction, RouteEntry, RouteMatch};
    use futures::future::BoxFuture;
    use std::io;
    use std::sync::{Arc, Mutex as StdMutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::sync::mpsc;

    struct PipeConnector {
        servers: Arc<StdMutex<Vec<DuplexStream>>>,
    }

    impl Connect for PipeConnector {
        fn connect(&self) -> BoxFuture<'static, io::Result<crate::net::Stream>> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.servers.lock().unwrap().push(server);
            Box::pin(async move { Ok(Box::new(client) as crate::net::Stream) })
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

    fn intent(cm: &Arc<ClusterManager>, end_stream: bool) -> UpstreamIntent {
        let cluster = cm.get("api").unwrap();
        let host = cluster.hosts()[0].clone();
        let mut headers = HeaderMap::new();
        headers.set_method(&Method::GET);
        headers.set_path("/x");
        headers.set_host("api.internal");
        UpstreamIntent {
            cluster,
            host,
            route: Arc::new(Route {
                name: "api".into(),
                rule: RouteMatch::prefix("/"),
                action: RouteAction::Cluster(RouteEntry::to_cluster("api")),
            }),
            headers,
            end_stream,
            priority: ResourcePriority::Default,
        }
    }

    async fn setup() -> (Arc<ClusterManager>, Arc<StdMutex<Vec<DuplexStream>>>) {
        let servers: Arc<StdMutex<Vec<DuplexStream>>> = Arc::default();
        let cm = ClusterManager::with_connector_factory(
            CodecSettings::default(),
            Arc::new(PipeFactory {
                servers: servers.clone(),
            }),
        );
        cm.add_or_update_cluster(
            Arc::new(ClusterInfo::new("api", DiscoveryType::Static)),
            vec![Host::new("api", "10.0.0.1", 8080)],
        );
        (cm, servers)
    }

    async fn take_server(servers: &Arc<StdMutex<Vec<DuplexStream>>>) -> DuplexStream {
        loop {
            if let Some(server) = servers.lock().unwrap().pop() {
                return server;
            }
            tokio::task::yield_now().await;
        }
    }

    async fn read_request(server: &mut DuplexStream) -> String {
        let mut collected = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = server.read(&mut chunk).await.unwrap();
            collected.extend_from_slice(&chunk[..n]);
            if collected.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8(collected).unwrap()
    }

    #[tokio::test]
    async fn full_exchange() {
        let (cm, servers) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_upstream_request(intent(&cm, true), None, tx, false));

        let mut server = take_server(&servers).await;
        let request = read_request(&mut server).await;
        assert!(request.starts_with("GET /x HTTP/1.1\r\n"));
        assert!(request.contains("Host: api.internal\r\n"));
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();

        match rx.recv().await.unwrap() {
            UpstreamEvent::ResponseHeaders(headers, false) => {
                assert_eq!(headers.status(), Some(http::StatusCode::OK));
            }
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            UpstreamEvent::ResponseData(data, true) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }
        task.await.unwrap();
        // client parked for reuse
        let cluster = cm.get("api").unwrap();
        let host = cluster.hosts()[0].clone();
        let pool = cluster.http_conn_pool(&host, ResourcePriority::Default);
        assert_eq!(pool.stats().ready, 1);
    }

    #[tokio::test]
    async fn request_body_streams_chunked() {
        let (cm, servers) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (body_tx, body_rx) = mpsc::unbounded_channel();
        let mut staged = intent(&cm, false);
        staged.headers.set_method(&Method::POST);
        let task = tokio::spawn(run_upstream_request(staged, Some(body_rx), tx, false));

        let mut server = take_server(&servers).await;
        body_tx
            .send(RequestBodyEvent::Data(Bytes::from_static(b"hi"), true))
            .unwrap();

        let mut collected = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = server.read(&mut chunk).await.unwrap();
            collected.extend_from_slice(&chunk[..n]);
            if collected.windows(5).any(|w| w == b"0\r\n\r\n") {
                break;
            }
        }
        let text = String::from_utf8(collected).unwrap();
        assert!(text.contains("Transfer-Encoding: chunked\r\n"));
        assert!(text.contains("2\r\nhi\r\n0\r\n\r\n"));

        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n")
            .await
            .unwrap();
        match rx.recv().await.unwrap() {
            UpstreamEvent::ResponseHeaders(_, true) => {}
            other => panic!("unexpected {:?}", other),
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn truncated_response_resets_with_force_flag() {
        let (cm, servers) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_upstream_request(intent(&cm, true), None, tx, true));

        let mut server = take_server(&servers).await;
        let _ = read_request(&mut server).await;
        server
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhello")
            .await
            .unwrap();
        drop(server);

        match rx.recv().await.unwrap() {
            UpstreamEvent::ResponseHeaders(_, false) => {}
            other => panic!("unexpected {:?}", other),
        }
        match rx.recv().await.unwrap() {
            UpstreamEvent::ResponseData(data, false) => assert_eq!(&data[..], b"hello"),
            other => panic!("unexpected {:?}", other),
        }
        loop {
            match rx.recv().await.unwrap() {
                UpstreamEvent::Reset(StreamResetReason::Http1PrematureUpstreamHalfClose) => break,
                UpstreamEvent::ResponseData(_, _) => continue,
                other => panic!("unexpected {:?}", other),
            }
        }
        task.await.unwrap();
    }

    #[tokio::test]
    async fn protocol_garbage_resets() {
        let (cm, servers) = setup().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_upstream_request(intent(&cm, true), None, tx, false));

        let mut server = take_server(&servers).await;
        let _ = read_request(&mut server).await;
        server.write_all(b"not http at all\r\n\r\n").await.unwrap();

        match rx.recv().await.unwrap() {
            UpstreamEvent::Reset(StreamResetReason::ProtocolError) => {}
            other => panic!("unexpected {:?}", other),
        }
        task.await.unwrap();
    }
}
