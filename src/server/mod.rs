use std::collections::VecDeque;
use std::ops::ControlFlow;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::{Bytes, BytesMut};
use futures::future;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::cluster::manager::ClusterManager;
use crate::conn::manager::{ConnectionManager, FilterChainFactory, FollowUp, HcmConfig};
use crate::conn::stream::StreamAgenda;
use crate::dfp::cluster::{DfpCluster, DfpWorkerState};
use crate::dfp::filter::DfpFilter;
use crate::filter::manager::FilterChainBuilder;
use crate::filter::state_filter::{RewriteRule, StateFilter};
use crate::net::listener::ListenerAddress;
use crate::net::Stream;
use crate::proto::StreamId;
use crate::router::filter::RouterFilter;
use crate::router::route::RouteConfig;
use crate::router::upstream::{run_upstream_request, UpstreamEvent};

const READ_CHUNK: usize = 16 * 1024;

/// the stock chain: state filter, optional dynamic proxy, router last
pub struct ProxyFilterChain {
    cluster_manager: Arc<ClusterManager>,
    routes: Arc<ArcSwap<RouteConfig>>,
    dfp: Option<(Arc<DfpCluster>, Arc<DfpWorkerState>)>,
    rewrite_rules: Vec<RewriteRule>,
}

impl ProxyFilterChain {
    pub fn new(
        cluster_manager: Arc<ClusterManager>,
        routes: Arc<ArcSwap<RouteConfig>>,
    ) -> Self {
        ProxyFilterChain {
            cluster_manager,
            routes,
            dfp: None,
            rewrite_rules: Vec::new(),
        }
    }

    pub fn with_dynamic_forward_proxy(
        mut self,
        dfp: Arc<DfpCluster>,
        worker: Arc<DfpWorkerState>,
    ) -> Self {
        self.dfp = Some((dfp, worker));
        self
    }

    pub fn with_rewrite_rules(mut self, rules: Vec<RewriteRule>) -> Self {
        self.rewrite_rules = rules;
        self
    }
}

impl FilterChainFactory for ProxyFilterChain {
    fn create_filter_chain(&self, chain: &mut FilterChainBuilder, agenda: &Arc<StreamAgenda>) {
        chain.add_decoder_filter(Box::new(StateFilter::new(self.rewrite_rules.clone())));
        if let Some((dfp, worker)) = &self.dfp {
            chain.add_decoder_filter(Box::new(DfpFilter::new(
                dfp.clone(),
                self.cluster_manager.clone(),
                worker.clone(),
                agenda.cluster_load.clone(),
            )));
        }
        chain.add_decoder_filter(Box::new(RouterFilter::new(
            self.cluster_manager.clone(),
            self.routes.clone(),
            agenda.router.clone(),
        )));
    }
}

enum Inbound {
    Read(std::io::Result<usize>),
    Upstream(Option<UpstreamEvent>),
}

/// drive one downstream connection to completion
pub async fn serve_connection(config: Arc<HcmConfig>, mut socket: Stream) {
    let mut hcm = ConnectionManager::new(config);
    let mut upstream: Option<(StreamId, UnboundedReceiver<UpstreamEvent>)> = None;
    let mut read_buf = BytesMut::with_capacity(READ_CHUNK);

    loop {
        if flush_output(&mut hcm, &mut socket).await.is_err() {
            hcm.on_downstream_close();
            break;
        }

        let inbound = match upstream.as_mut() {
            Some((_, rx)) => tokio::select! {
                result = socket.read_buf(&mut read_buf) => Inbound::Read(result),
                event = rx.recv() => Inbound::Upstream(event),
            },
            None => Inbound::Read(socket.read_buf(&mut read_buf).await),
        };

        let followups = match inbound {
            Inbound::Read(Ok(0)) | Inbound::Read(Err(_)) => {
                hcm.on_downstream_close();
                break;
            }
            Inbound::Read(Ok(_)) => {
                let data = read_buf.split().freeze();
                hcm.on_data(data)
            }
            Inbound::Upstream(Some(event)) => {
                let id = upstream.as_ref().expect("selected on upstream").0;
                hcm.on_upstream_event(id, event)
            }
            Inbound::Upstream(None) => {
                // bridge finished; anything left came through already
                upstream = None;
                continue;
            }
        };

        if handle_followups(&mut hcm, &mut upstream, &mut socket, followups)
            .await
            .is_break()
        {
            break;
        }

        // a finished exchange leaves no stream; drop the stale receiver
        if hcm.active_streams() == 0 {
            upstream = None;
        }
    }

    let _ = flush_output(&mut hcm, &mut socket).await;
    let _ = socket.shutdown().await;
}

async fn flush_output(
    hcm: &mut ConnectionManager,
    socket: &mut Stream,
) -> std::io::Result<()> {
    while let Some(bytes) = hcm.take_output() {
        socket.write_all(&bytes).await?;
    }
    socket.flush().await
}

async fn handle_followups(
    hcm: &mut ConnectionManager,
    upstream: &mut Option<(StreamId, UnboundedReceiver<UpstreamEvent>)>,
    socket: &mut Stream,
    followups: Vec<FollowUp>,
) -> ControlFlow<()> {
    let mut queue: VecDeque<FollowUp> = followups.into();
    while let Some(followup) = queue.pop_front() {
        match followup {
            FollowUp::AwaitClusterLoad(id) => {
                let Some(handle) = hcm.take_cluster_load_wait(id) else {
                    continue;
                };
                // decoding is paused; nothing else can make progress here
                let ok = handle.rx.await.unwrap_or(false);
                queue.extend(hcm.on_cluster_load_complete(id, ok));
            }
            FollowUp::StartUpstream(id) => {
                let Some((intent, body_rx, force_reset)) = hcm.take_upstream_work(id) else {
                    continue;
                };
                let (tx, rx) = mpsc::unbounded_channel();
                let task = tokio::spawn(run_upstream_request(intent, body_rx, tx, force_reset));
                hcm.attach_upstream_task(id, task);
                *upstream = Some((id, rx));
            }
            FollowUp::Redispatch => {
                queue.extend(hcm.on_data(Bytes::new()));
            }
            FollowUp::CloseConnection { flush, reason } => {
                tracing::debug!(reason, "closing downstream connection");
                if flush {
                    let _ = flush_output(hcm, socket).await;
                }
                return ControlFlow::Break(());
            }
        }
        if flush_output(hcm, socket).await.is_err() {
            hcm.on_downstream_close();
            return ControlFlow::Break(());
        }
    }
    ControlFlow::Continue(())
}

/// binds listeners and fans accepted connections out to handler tasks
pub struct Server {
    config: Arc<HcmConfig>,
    listeners: Vec<ListenerAddress>,
}

impl Server {
    pub fn new(config: Arc<HcmConfig>) -> Self {
        Server {
            config,
            listeners: Vec::new(),
        }
    }

    pub fn add_listener(&mut self, address: ListenerAddress) {
        self.listeners.push(address);
    }

    pub async fn run(self) -> std::io::Result<()> {
        let mut accept_loops = Vec::new();
        for address in self.listeners {
            let listener = address.bind()?;
            let config = self.config.clone();
            tracing::info!(?address, "listener bound");
            accept_loops.push(tokio::spawn(async move {
                loop {
                    match listener.accept_stream().await {
                        Ok((stream, peer)) => {
                            tracing::debug!(%peer, "accepted downstream connection");
                            let config = config.clone();
                            tokio::spawn(serve_connection(config, stream));
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                        }
                    }
                }
            }));
        }
        future::join_all(accept_loops).await;
        Ok(())
    }
}
