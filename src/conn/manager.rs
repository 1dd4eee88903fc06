use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;

use crate::buffer::Buffer;
use crate::conn::info::StreamInfo;
use crate::conn::stream::{next_stream_id, ActiveStream, StreamAgenda};
use crate::error::{CodecError, StreamResetReason};
use crate::filter::local_reply::{LocalReply, LocalReplyPolicy};
use crate::filter::manager::{EncodeSink, FilterChainBuilder, FilterManager};
use crate::filter::state::ConnectionState;
use crate::headers::{values, HeaderMap};
use crate::http1::ServerConnection;
use crate::proto::{CodecSettings, ServerCodecCallbacks, StreamId};
use crate::router::filter::reset_details;
use crate::router::upstream::UpstreamEvent;

// premature-reset defense trips at this many closed requests, or at twice
// the rate under it
const PREMATURE_RESET_LIMIT: u64 = 500;

/// builds the per-stream filter chain
pub trait FilterChainFactory: Send + Sync {
    fn create_filter_chain(&self, chain: &mut FilterChainBuilder, agenda: &Arc<StreamAgenda>);
    /// chain for an upgrade request; false means no upgrade support
    fn create_upgrade_filter_chain(
        &self,
        _upgrade: &str,
        _chain: &mut FilterChainBuilder,
        _agenda: &Arc<StreamAgenda>,
    ) -> bool {
        false
    }
}

/// connection-manager tunables
pub struct HcmConfig {
    pub settings: CodecSettings,
    pub filter_factory: Arc<dyn FilterChainFactory>,
    pub local_reply: Arc<dyn LocalReplyPolicy>,
    /// 0 means unlimited
    pub max_requests_per_connection: u64,
    pub buffer_limit: usize,
    pub force_reset_on_premature_upstream_half_close: bool,
    pub proxy_100_continue: bool,
}

/// connection-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainState {
    NotDraining,
    /// stop after the in-flight response
    Draining,
    Closing,
}

/// async work the driver must pick up after a synchronous step
#[derive(Debug)]
pub enum FollowUp {
    /// a filter parked a cluster-load waiter on the agenda
    AwaitClusterLoad(StreamId),
    /// the router staged an upstream intent
    StartUpstream(StreamId),
    /// run the buffered input again (keep-alive pipelining)
    Redispatch,
    /// tear the connection down
    CloseConnection { flush: bool, reason: &'static str },
}

enum CodecEvent {
    NewStream(StreamId),
    Headers(StreamId, HeaderMap, bool),
    Data(StreamId, Bytes, bool),
    Trailers(StreamId, HeaderMap),
    ServerName(String),
}

#[derive(Default)]
struct EventSink {
    events: Vec<CodecEvent>,
}

impl ServerCodecCallbacks for EventSink {
    fn new_stream(&mut self) -> StreamId {
        let id = next_stream_id();
        self.events.push(CodecEvent::NewStream(id));
        id
    }
    fn decode_headers(&mut self, stream: StreamId, headers: HeaderMap, end_stream: bool) {
        self.events
            .push(CodecEvent::Headers(stream, headers, end_stream));
    }
    fn decode_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool) {
        self.events.push(CodecEvent::Data(stream, data, end_stream));
    }
    fn decode_trailers(&mut self, stream: StreamId, trailers: HeaderMap) {
        self.events.push(CodecEvent::Trailers(stream, trailers));
    }
    fn set_requested_server_name(&mut self, name: &str) {
        self.events.push(CodecEvent::ServerName(name.to_string()));
    }
}

/// adapts the response side of the server codec to the filter manager
struct CodecSink<'a> {
    codec: &'a mut ServerConnection,
}

impl EncodeSink for CodecSink<'_> {
    fn encode_1xx_headers(&mut self, headers: &HeaderMap) {
        if let Err(e) = self.codec.encode_response_headers(headers, false) {
            tracing::debug!(error = %e, "failed to encode informational headers");
        }
    }
    fn encode_headers(&mut self, headers: &HeaderMap, end_stream: bool) {
        if let Err(e) = self.codec.encode_response_headers(headers, end_stream) {
            tracing::warn!(error = %e, "failed to encode response headers");
        }
    }
    fn encode_data(&mut self, data: Bytes, end_stream: bool) {
        if let Err(e) = self.codec.encode_response_data(data, end_stream) {
            tracing::warn!(error = %e, "failed to encode response data");
        }
    }
    fn encode_trailers(&mut self, trailers: &HeaderMap) {
        if let Err(e) = self.codec.encode_response_trailers(trailers) {
            tracing::warn!(error = %e, "failed to encode response trailers");
        }
    }
}

/// the top-level network read filter for one downstream connection
///
/// owns the server codec and the active streams, feeds decoded events
/// into each stream's filter chain and hands async work back to the
/// driver as `FollowUp`s.
pub struct ConnectionManager {
    config: Arc<HcmConfig>,
    codec: Option<ServerConnection>,
    streams: Vec<ActiveStream>,
    connection_state: ConnectionState,
    requested_server_name: Option<String>,
    accumulated_requests: u64,
    drain_state: DrainState,
    closed_non_internally_destroyed: u64,
    premature_stream_requests: u64,
}

impl ConnectionManager {
    pub fn new(config: Arc<HcmConfig>) -> Self {
        ConnectionManager {
            config,
            codec: None,
            streams: Vec::new(),
            connection_state: ConnectionState::default(),
            requested_server_name: None,
            accumulated_requests: 0,
            drain_state: DrainState::NotDraining,
            closed_non_internally_destroyed: 0,
            premature_stream_requests: 0,
        }
    }

    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }

    pub fn accumulated_requests(&self) -> u64 {
        self.accumulated_requests
    }

    /// serialized response bytes waiting for the socket
    pub fn take_output(&mut self) -> Option<Bytes> {
        let codec = self.codec.as_mut()?;
        let output = codec.output();
        if output.is_empty() {
            return None;
        }
        Some(output.take_all())
    }

    /// feed downstream bytes through codec and filter chains
    pub fn on_data(&mut self, data: Bytes) -> Vec<FollowUp> {
        let mut followups = Vec::new();
        if self.codec.is_none() {
            self.codec = Some(ServerConnection::new(self.config.settings.clone()));
        }
        let mut input = Buffer::from_bytes(data);
        loop {
            let mut sink = EventSink::default();
            let codec = self.codec.as_mut().expect("codec just created");
            let error = codec.dispatch(&mut input, &mut sink).err();
            for event in sink.events {
                self.process_event(event, &mut followups);
            }
            if let Some(error) = error {
                self.handle_codec_error(error, &mut followups);
                break;
            }
            // a completed keep-alive exchange may leave the next request
            // already buffered
            let codec = self.codec.as_mut().expect("codec");
            if self.streams.is_empty()
                && codec.has_buffered_input()
                && self.drain_state == DrainState::NotDraining
            {
                continue;
            }
            break;
        }
        // the loop above already redispatched; only async completions need
        // the driver to come back
        followups.retain(|f| !matches!(f, FollowUp::Redispatch));
        followups
    }

    fn process_event(&mut self, event: CodecEvent, followups: &mut Vec<FollowUp>) {
        match event {
            CodecEvent::NewStream(id) => {
                self.accumulated_requests += 1;
                let max = self.config.max_requests_per_connection;
                if max > 0 && self.accumulated_requests >= max {
                    tracing::debug!(max, "connection reached request budget, draining");
                    self.drain_state = DrainState::Draining;
                }
                self.streams.push(ActiveStream::new(id));
            }
            CodecEvent::ServerName(name) => {
                self.requested_server_name = Some(name);
            }
            CodecEvent::Headers(id, headers, end_stream) => {
                self.build_stream_chain(id, &headers);
                let Some(index) = self.stream_index(id) else {
                    return;
                };
                let codec = self.codec.as_mut().expect("codec");
                let stream = &mut self.streams[index];
                stream
                    .fm()
                    .decode_headers(headers, end_stream, &mut CodecSink { codec });
                self.post_filter_call(id, followups);
            }
            CodecEvent::Data(id, data, end_stream) => {
                let Some(index) = self.stream_index(id) else {
                    return;
                };
                if self.streams[index].fm.is_none() {
                    return;
                }
                let codec = self.codec.as_mut().expect("codec");
                let stream = &mut self.streams[index];
                stream
                    .fm()
                    .decode_data(data, end_stream, &mut CodecSink { codec });
                self.post_filter_call(id, followups);
            }
            CodecEvent::Trailers(id, trailers) => {
                let Some(index) = self.stream_index(id) else {
                    return;
                };
                if self.streams[index].fm.is_none() {
                    return;
                }
                let codec = self.codec.as_mut().expect("codec");
                let stream = &mut self.streams[index];
                stream
                    .fm()
                    .decode_trailers(trailers, &mut CodecSink { codec });
                self.post_filter_call(id, followups);
            }
        }
    }

    fn build_stream_chain(&mut self, id: StreamId, headers: &HeaderMap) {
        let Some(index) = self.stream_index(id) else {
            return;
        };
        let agenda = self.streams[index].agenda.clone();
        let mut builder = FilterChainBuilder::new();
        let mut upgrade_accepted = false;
        if let Some(upgrade) = headers.get_str(values::UPGRADE) {
            let upgrade = upgrade.to_string();
            upgrade_accepted = self.config.filter_factory.create_upgrade_filter_chain(
                &upgrade,
                &mut builder,
                &agenda,
            );
        }
        if !upgrade_accepted {
            self.config
                .filter_factory
                .create_filter_chain(&mut builder, &agenda);
        }
        let mut info = StreamInfo::new(id, self.connection_state.clone());
        info.protocol = self
            .codec
            .as_ref()
            .map(crate::http1::ServerConnection::protocol);
        info.requested_server_name = self.requested_server_name.clone();
        let mut fm = FilterManager::new(builder, info, self.config.local_reply.clone());
        fm.set_buffer_limit(self.config.buffer_limit);
        self.streams[index].fm = Some(fm);
    }

    fn stream_index(&self, id: StreamId) -> Option<usize> {
        self.streams.iter().position(|stream| stream.id == id)
    }

    /// shared follow-through after any filter-chain call
    fn post_filter_call(&mut self, id: StreamId, followups: &mut Vec<FollowUp>) {
        let Some(index) = self.stream_index(id) else {
            return;
        };
        if let Some(reason) = self.streams[index].fm().take_reset() {
            self.reset_stream(id, reason, followups);
            return;
        }
        if self.streams[index].agenda.cluster_load.lock().is_some() {
            followups.push(FollowUp::AwaitClusterLoad(id));
            return;
        }
        {
            let stream = &self.streams[index];
            let router = stream.agenda.router.lock();
            if router.intent.is_some() && stream.upstream_task.is_none() {
                followups.push(FollowUp::StartUpstream(id));
            }
        }
        self.maybe_finish_stream(id, followups);
    }

    fn maybe_finish_stream(&mut self, id: StreamId, followups: &mut Vec<FollowUp>) {
        let Some(index) = self.stream_index(id) else {
            return;
        };
        let encode_done = self.streams[index]
            .fm
            .as_ref()
            .map_or(false, FilterManager::encode_completed);
        if !encode_done {
            return;
        }
        let codec = self.codec.as_mut().expect("codec");
        if !codec.request_complete() {
            // the response finished while the request was still streaming;
            // framing is unrecoverable, give the connection up
            tracing::debug!(stream = id, "response done before request, closing");
            self.destroy_stream(id, false, followups);
            followups.push(FollowUp::CloseConnection {
                flush: true,
                reason: "incomplete_request",
            });
            return;
        }
        let close_after = codec.close_after_response();
        self.streams[index].codec_saw_local_complete = true;
        codec.on_response_complete();
        self.destroy_stream(id, false, followups);
        if close_after || self.drain_state != DrainState::NotDraining {
            self.drain_state = DrainState::Closing;
            followups.push(FollowUp::CloseConnection {
                flush: true,
                reason: "connection_done",
            });
        } else if self.codec.as_ref().expect("codec").has_buffered_input() {
            followups.push(FollowUp::Redispatch);
        }
    }

    fn reset_stream(
        &mut self,
        id: StreamId,
        reason: StreamResetReason,
        followups: &mut Vec<FollowUp>,
    ) {
        let Some(index) = self.stream_index(id) else {
            return;
        };
        tracing::debug!(stream = id, ?reason, "resetting stream");
        self.streams[index].abort_upstream();
        self.streams[index].notify_reset(reason);
        if let Some(fm) = self.streams[index].fm.as_mut() {
            fm.on_stream_reset(reason);
        }
        if let Some(codec) = self.codec.as_mut() {
            codec.reset();
        }
        self.destroy_stream(id, true, followups);
        followups.push(FollowUp::CloseConnection {
            flush: true,
            reason: "stream_reset",
        });
    }

    fn destroy_stream(&mut self, id: StreamId, was_reset: bool, followups: &mut Vec<FollowUp>) {
        let Some(index) = self.stream_index(id) else {
            return;
        };
        let mut stream = self.streams.remove(index);
        stream.abort_upstream();
        let premature = stream.is_premature();
        if let Some(fm) = stream.fm.as_mut() {
            fm.destroy();
        }
        if !stream.is_internally_destroyed {
            self.closed_non_internally_destroyed += 1;
            if was_reset && premature {
                self.premature_stream_requests += 1;
            }
        }
        if self.maybe_drain_due_to_premature_resets() {
            followups.push(FollowUp::CloseConnection {
                flush: false,
                reason: "too_many_premature_resets",
            });
        }
    }

    fn maybe_drain_due_to_premature_resets(&self) -> bool {
        if self.closed_non_internally_destroyed == 0 {
            return false;
        }
        if self.closed_non_internally_destroyed < PREMATURE_RESET_LIMIT {
            self.premature_stream_requests * 2 >= PREMATURE_RESET_LIMIT
        } else {
            self.premature_stream_requests * 2 >= self.closed_non_internally_destroyed
        }
    }

    fn handle_codec_error(&mut self, error: CodecError, followups: &mut Vec<FollowUp>) {
        tracing::debug!(error = %error, "codec error on downstream connection");
        match &error {
            CodecError::Protocol { .. } => {
                let replied_through_stream = self.config.settings.stream_error_on_invalid_http_message
                    && self.try_stream_local_reply(&error);
                if !replied_through_stream {
                    let codec = self.codec.as_mut().expect("codec");
                    if !codec.response_started() {
                        codec.encode_error_response(error.response_code(), error.details());
                    }
                }
            }
            CodecError::Client(_) | CodecError::PrematureResponse => {}
        }
        let ids: Vec<StreamId> = self.streams.iter().map(|s| s.id).collect();
        for id in ids {
            if let Some(index) = self.stream_index(id) {
                if let Some(fm) = self.streams[index].fm.as_mut() {
                    fm.on_stream_reset(StreamResetReason::ProtocolError);
                }
            }
            self.destroy_stream(id, true, followups);
        }
        followups.push(FollowUp::CloseConnection {
            flush: true,
            reason: "codec_error",
        });
    }

    /// route a protocol error through the stream's reply machinery
    fn try_stream_local_reply(&mut self, error: &CodecError) -> bool {
        let Some(stream) = self.streams.last() else {
            return false;
        };
        let id = stream.id;
        let Some(index) = self.stream_index(id) else {
            return false;
        };
        if self.streams[index].fm.is_none() {
            return false;
        }
        let codec = self.codec.as_mut().expect("codec");
        if codec.response_started() {
            return false;
        }
        let stream = &mut self.streams[index];
        stream.fm().send_local_reply(
            LocalReply::new(error.response_code(), error.details()),
            &mut CodecSink { codec },
        );
        true
    }

    /// the driver resolved (or failed) a parked cluster load
    pub fn on_cluster_load_complete(&mut self, id: StreamId, ok: bool) -> Vec<FollowUp> {
        let mut followups = Vec::new();
        let Some(index) = self.stream_index(id) else {
            return followups;
        };
        if self.streams[index].fm.is_none() {
            return followups;
        }
        let codec = self.codec.as_mut().expect("codec");
        let stream = &mut self.streams[index];
        if ok {
            stream.fm().continue_decoding(&mut CodecSink { codec });
        } else {
            stream.fm().send_local_reply(
                LocalReply::new(StatusCode::SERVICE_UNAVAILABLE, "dfp_cluster_load_failure"),
                &mut CodecSink { codec },
            );
        }
        self.post_filter_call(id, &mut followups);
        followups
    }

    /// response-side traffic from the upstream bridge
    pub fn on_upstream_event(&mut self, id: StreamId, event: UpstreamEvent) -> Vec<FollowUp> {
        let mut followups = Vec::new();
        let Some(index) = self.stream_index(id) else {
            return followups;
        };
        if self.streams[index].fm.is_none() {
            return followups;
        }
        let codec = self.codec.as_mut().expect("codec");
        let stream = &mut self.streams[index];
        match event {
            UpstreamEvent::Response1xx(headers) => {
                if self.config.proxy_100_continue {
                    stream
                        .fm()
                        .encode_1xx_headers(headers, &mut CodecSink { codec });
                }
            }
            UpstreamEvent::ResponseHeaders(mut headers, end_stream) => {
                {
                    let mut router = stream.agenda.router.lock();
                    if let Some(entry) = router.route.as_ref().and_then(|route| route.entry()) {
                        entry.finalize_response_headers(&mut headers);
                    }
                    router.response_started = true;
                }
                stream
                    .fm()
                    .encode_headers(headers, end_stream, &mut CodecSink { codec });
            }
            UpstreamEvent::ResponseData(data, end_stream) => {
                stream
                    .fm()
                    .encode_data(data, end_stream, &mut CodecSink { codec });
            }
            UpstreamEvent::ResponseTrailers(trailers) => {
                stream
                    .fm()
                    .encode_trailers(trailers, &mut CodecSink { codec });
            }
            UpstreamEvent::Reset(reason) => {
                stream.agenda.router.lock().upstream_gone = true;
                let flag = reason.response_flag();
                let fm = stream.fm();
                fm.info_mut().set_response_flag(flag);
                fm.send_local_reply(
                    LocalReply::new(reason.upstream_status(), reset_details(reason)),
                    &mut CodecSink { codec },
                );
            }
            UpstreamEvent::PoolFailure(reason, message) => {
                tracing::debug!(stream = id, ?reason, %message, "pool failure");
                stream.agenda.router.lock().upstream_gone = true;
                let reset = reason.reset_reason();
                let fm = stream.fm();
                fm.info_mut().set_response_flag(reset.response_flag());
                fm.send_local_reply(
                    LocalReply::new(reset.upstream_status(), reset_details(reset)),
                    &mut CodecSink { codec },
                );
            }
        }
        self.post_filter_call(id, &mut followups);
        followups
    }

    /// the downstream peer went away
    pub fn on_downstream_close(&mut self) {
        let ids: Vec<StreamId> = self.streams.iter().map(|s| s.id).collect();
        let mut sink = Vec::new();
        for id in ids {
            if let Some(index) = self.stream_index(id) {
                self.streams[index].abort_upstream();
                self.streams[index].notify_reset(StreamResetReason::ConnectionTermination);
                if let Some(fm) = self.streams[index].fm.as_mut() {
                    fm.on_stream_reset(StreamResetReason::ConnectionTermination);
                }
            }
            self.destroy_stream(id, true, &mut sink);
        }
    }

    /// the driver wants to know what to start for this stream
    pub fn take_upstream_work(
        &mut self,
        id: StreamId,
    ) -> Option<(
        crate::router::filter::UpstreamIntent,
        Option<tokio::sync::mpsc::UnboundedReceiver<crate::router::filter::RequestBodyEvent>>,
        bool,
    )> {
        let index = self.stream_index(id)?;
        let stream = &self.streams[index];
        let mut router = stream.agenda.router.lock();
        let intent = router.intent.take()?;
        let body_rx = router.body_rx.take();
        Some((
            intent,
            body_rx,
            self.config.force_reset_on_premature_upstream_half_close,
        ))
    }

    pub fn take_cluster_load_wait(
        &mut self,
        id: StreamId,
    ) -> Option<crate::dfp::cluster::LoadClusterEntryHandle> {
        let index = self.stream_index(id)?;
        self.streams[index].agenda.cluster_load.lock().take()
    }

    pub fn attach_upstream_task(&mut self, id: StreamId, task: tokio::task::JoinHandle<()>) {
        if let Some(index) = self.stream_index(id) {
            self.streams[index].upstream_task = Some(task);
        }
    }
}
