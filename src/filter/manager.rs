use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;

use crate::buffer::Buffer;
use crate::conn::info::StreamInfo;
use crate::error::StreamResetReason;
use crate::filter::local_reply::{self, LocalReply, LocalReplyPolicy};
use crate::filter::{
    DecoderFilter, EncoderFilter, FilterCallbacks, FilterDataStatus, FilterHeadersStatus,
    FilterTrailersStatus, LocalReplyAction, LocalReplyData,
};
use crate::filter::state::FilterState;
use crate::headers::HeaderMap;

/// where encoded response artifacts leave the chain (the codec, in prod)
pub trait EncodeSink {
    fn encode_1xx_headers(&mut self, headers: &HeaderMap);
    fn encode_headers(&mut self, headers: &HeaderMap, end_stream: bool);
    fn encode_data(&mut self, data: Bytes, end_stream: bool);
    fn encode_trailers(&mut self, trailers: &HeaderMap);
}

/// why iteration halted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopKind {
    /// a headers callback stopped at this filter; it has not seen data
    Headers,
    /// a data callback stopped at this filter; it saw the data it stopped on
    Data,
    /// a data callback claimed the body; incoming data is discarded
    DataNoBuffer,
    /// a trailers callback stopped at this filter
    Trailers,
}

/// per-direction iteration state
struct Direction {
    headers: Option<HeaderMap>,
    // end_stream as it stood when the headers arrived
    headers_end_stream: bool,
    end_stream_seen: bool,
    headers_delivered: bool,
    // index of the filter that halted, plus how
    stopped_at: Option<(usize, StopKind)>,
    pending_data: Buffer,
    pending_data_end: bool,
    pending_trailers: Option<HeaderMap>,
    aborted: bool,
    completed: bool,
}

impl Direction {
    fn new() -> Self {
        Direction {
            headers: None,
            headers_end_stream: false,
            end_stream_seen: false,
            headers_delivered: false,
            stopped_at: None,
            pending_data: Buffer::new(),
            pending_data_end: false,
            pending_trailers: None,
            aborted: false,
            completed: false,
        }
    }

    fn stopped(&self) -> bool {
        self.stopped_at.is_some()
    }
}

/// the per-stream pieces a filter is allowed to touch
pub struct StreamContext {
    pub info: StreamInfo,
    pub request_headers: Option<HeaderMap>,
    pending_local_reply: Option<LocalReply>,
    reset_requested: Option<StreamResetReason>,
}

impl FilterCallbacks for StreamContext {
    fn stream_id(&self) -> u64 {
        self.info.stream_id
    }
    fn stream_info(&mut self) -> &mut StreamInfo {
        &mut self.info
    }
    fn filter_state(&mut self) -> &mut FilterState {
        &mut self.info.filter_state
    }
    fn request_headers(&mut self) -> Option<&mut HeaderMap> {
        self.request_headers.as_mut()
    }
    fn send_local_reply(&mut self, reply: LocalReply) {
        // first request wins; duplicates would double-encode
        if self.pending_local_reply.is_none() {
            self.pending_local_reply = Some(reply);
        }
    }
    fn set_response_flag(&mut self, flag: crate::error::ResponseFlag) {
        self.info.set_response_flag(flag);
    }
    fn requested_server_name(&self) -> Option<&str> {
        self.info.requested_server_name.as_deref()
    }
}

/// ordered bidirectional filter chain with suspension and local replies
///
/// decoder filters run in insertion order, encoder filters in reverse.
/// a stopped side parks its artifacts here until `continue_decoding` /
/// `continue_encoding`. every entry point takes the encode sink so a
/// deferred local reply can flush as soon as the triggering callback has
/// unwound.
pub struct FilterManager {
    decoders: Vec<Box<dyn DecoderFilter>>,
    encoders: Vec<Box<dyn EncoderFilter>>,
    decode: Direction,
    encode: Direction,
    pub ctx: StreamContext,
    buffer_limit: usize,
    local_reply_policy: Arc<dyn LocalReplyPolicy>,
    is_head_request: bool,
    non_1xx_headers_encoded: bool,
    encode_ended: bool,
    destroyed: bool,
}

/// what happened to a decode entry call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Completed,
    Suspended,
}

pub struct FilterChainBuilder {
    decoders: Vec<Box<dyn DecoderFilter>>,
    encoders: Vec<Box<dyn EncoderFilter>>,
}

impl FilterChainBuilder {
    pub fn new() -> Self {
        FilterChainBuilder {
            decoders: Vec::new(),
            encoders: Vec::new(),
        }
    }

    pub fn add_decoder_filter(&mut self, filter: Box<dyn DecoderFilter>) {
        self.decoders.push(filter);
    }

    pub fn add_encoder_filter(&mut self, filter: Box<dyn EncoderFilter>) {
        self.encoders.push(filter);
    }

    pub fn decoder_count(&self) -> usize {
        self.decoders.len()
    }

    pub fn encoder_count(&self) -> usize {
        self.encoders.len()
    }
}

impl Default for FilterChainBuilder {
    fn default() -> Self {
        Self::new()
    }
}

const DEFAULT_BUFFER_LIMIT: usize = 1024 * 1024;

impl FilterManager {
    pub fn new(
        chain: FilterChainBuilder,
        info: StreamInfo,
        local_reply_policy: Arc<dyn LocalReplyPolicy>,
    ) -> Self {
        FilterManager {
            decoders: chain.decoders,
            encoders: chain.encoders,
            decode: Direction::new(),
            encode: Direction::new(),
            ctx: StreamContext {
                info,
                request_headers: None,
                pending_local_reply: None,
                reset_requested: None,
            },
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            local_reply_policy,
            is_head_request: false,
            non_1xx_headers_encoded: false,
            encode_ended: false,
            destroyed: false,
        }
    }

    pub fn set_buffer_limit(&mut self, limit: usize) {
        self.buffer_limit = limit;
    }

    pub fn info(&self) -> &StreamInfo {
        &self.ctx.info
    }

    pub fn info_mut(&mut self) -> &mut StreamInfo {
        &mut self.ctx.info
    }

    /// request headers as the chain last saw them
    pub fn request_headers(&self) -> Option<&HeaderMap> {
        self.ctx
            .request_headers
            .as_ref()
            .or(self.decode.headers.as_ref())
    }

    pub fn decode_completed(&self) -> bool {
        self.decode.completed
    }

    pub fn encode_completed(&self) -> bool {
        self.encode_ended
    }

    pub fn response_headers_encoded(&self) -> bool {
        self.non_1xx_headers_encoded
    }

    /// a filter or the reply path demanded a stream reset
    pub fn take_reset(&mut self) -> Option<StreamResetReason> {
        self.ctx.reset_requested.take()
    }

    // ---------------------------------------------------------- decode --

    pub fn decode_headers(
        &mut self,
        headers: HeaderMap,
        end_stream: bool,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        self.is_head_request = headers.method() == Some(http::Method::HEAD);
        self.decode.headers = Some(headers);
        self.decode.headers_end_stream = end_stream;
        self.decode.end_stream_seen = end_stream;
        let outcome = self.run_decode_headers(0);
        self.drain_deferred(sink);
        outcome
    }

    fn run_decode_headers(&mut self, start: usize) -> IterationOutcome {
        let mut headers = match self.decode.headers.take() {
            Some(headers) => headers,
            None => return IterationOutcome::Completed,
        };
        let end_of_headers_stream = self.decode.headers_end_stream;
        for index in start..self.decoders.len() {
            if self.decode.aborted || self.ctx.pending_local_reply.is_some() {
                break;
            }
            let status =
                self.decoders[index].decode_headers(&mut headers, end_of_headers_stream, &mut self.ctx);
            if status == FilterHeadersStatus::StopIteration {
                self.decode.stopped_at = Some((index, StopKind::Headers));
                self.decode.headers = Some(headers);
                return IterationOutcome::Suspended;
            }
        }
        self.decode.headers_delivered = true;
        self.ctx.request_headers = Some(headers);
        if end_of_headers_stream {
            self.finish_decode();
        }
        IterationOutcome::Completed
    }

    pub fn decode_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        self.decode.end_stream_seen |= end_stream;
        let outcome = self.run_decode_data(data, end_stream);
        self.drain_deferred(sink);
        outcome
    }

    fn run_decode_data(&mut self, mut data: Bytes, end_stream: bool) -> IterationOutcome {
        if self.decode.aborted || self.decode.completed {
            return IterationOutcome::Completed;
        }
        match self.decode.stopped_at {
            Some((boundary, StopKind::Headers)) | Some((boundary, StopKind::Trailers)) => {
                // the stopping filter is waiting to resume; park the data
                // behind it, filters ahead still observe it live
                if self.observe_decode_data(&mut data, end_stream, boundary) {
                    return IterationOutcome::Suspended;
                }
                if self.decode.pending_data.len() + data.len() > self.buffer_limit {
                    self.overflow_decode_buffer();
                    return IterationOutcome::Suspended;
                }
                self.decode.pending_data.append(data);
                self.decode.pending_data_end |= end_stream;
                IterationOutcome::Suspended
            }
            Some((boundary, _)) => {
                // a data stop gates propagation, not delivery: the
                // stopping filter keeps seeing every chunk and re-decides
                if self.observe_decode_data(&mut data, end_stream, boundary) {
                    return IterationOutcome::Suspended;
                }
                match self.decoders[boundary].decode_data(&mut data, end_stream, &mut self.ctx) {
                    FilterDataStatus::Continue => {
                        // iteration released mid-stream: everything parked
                        // flows on past the boundary
                        self.decode.pending_data.append(std::mem::take(&mut data));
                        self.decode.pending_data_end |= end_stream;
                        self.decode.stopped_at = Some((boundary, StopKind::Data));
                        self.run_continue_decoding()
                    }
                    FilterDataStatus::StopIterationAndBuffer => {
                        if self.decode.pending_data.len() + data.len() > self.buffer_limit {
                            self.overflow_decode_buffer();
                            return IterationOutcome::Suspended;
                        }
                        self.decode.stopped_at = Some((boundary, StopKind::Data));
                        self.decode.pending_data.append(data);
                        self.decode.pending_data_end |= end_stream;
                        IterationOutcome::Suspended
                    }
                    FilterDataStatus::StopIterationNoBuffer => {
                        self.decode.stopped_at = Some((boundary, StopKind::DataNoBuffer));
                        self.decode.pending_data_end |= end_stream;
                        IterationOutcome::Suspended
                    }
                }
            }
            None => {
                match self.walk_decode_data(&mut data, end_stream, 0, self.decoders.len()) {
                    WalkResult::Completed => {
                        if end_stream {
                            self.finish_decode();
                        }
                        IterationOutcome::Completed
                    }
                    WalkResult::Stopped => IterationOutcome::Suspended,
                    WalkResult::Abort => IterationOutcome::Suspended,
                }
            }
        }
    }

    /// deliver data to filters ahead of a suspended boundary; their stop
    /// verdicts cannot nest under the outer suspension and are ignored
    fn observe_decode_data(&mut self, data: &mut Bytes, end_stream: bool, end: usize) -> bool {
        for index in 0..end {
            if self.decode.aborted || self.ctx.pending_local_reply.is_some() {
                return true;
            }
            let status = self.decoders[index].decode_data(data, end_stream, &mut self.ctx);
            if status != FilterDataStatus::Continue {
                tracing::debug!(filter = index, "ignoring nested data stop while suspended");
            }
        }
        false
    }

    /// run data through decoder filters [start, end); records stops
    fn walk_decode_data(
        &mut self,
        data: &mut Bytes,
        end_stream: bool,
        start: usize,
        end: usize,
    ) -> WalkResult {
        for index in start..end {
            if self.decode.aborted || self.ctx.pending_local_reply.is_some() {
                return WalkResult::Abort;
            }
            match self.decoders[index].decode_data(data, end_stream, &mut self.ctx) {
                FilterDataStatus::Continue => {}
                FilterDataStatus::StopIterationAndBuffer => {
                    if data.len() > self.buffer_limit {
                        self.overflow_decode_buffer();
                        return WalkResult::Abort;
                    }
                    self.decode.stopped_at = Some((index, StopKind::Data));
                    self.decode.pending_data.append(std::mem::take(data));
                    self.decode.pending_data_end |= end_stream;
                    return WalkResult::Stopped;
                }
                FilterDataStatus::StopIterationNoBuffer => {
                    self.decode.stopped_at = Some((index, StopKind::DataNoBuffer));
                    self.decode.pending_data_end |= end_stream;
                    return WalkResult::Stopped;
                }
            }
        }
        WalkResult::Completed
    }

    pub fn decode_trailers(
        &mut self,
        trailers: HeaderMap,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        self.decode.end_stream_seen = true;
        let outcome = if self.decode.stopped() || self.decode.aborted {
            self.decode.pending_trailers = Some(trailers);
            IterationOutcome::Suspended
        } else {
            self.run_decode_trailers(trailers, 0)
        };
        self.drain_deferred(sink);
        outcome
    }

    fn run_decode_trailers(&mut self, mut trailers: HeaderMap, start: usize) -> IterationOutcome {
        for index in start..self.decoders.len() {
            if self.decode.aborted || self.ctx.pending_local_reply.is_some() {
                return IterationOutcome::Suspended;
            }
            match self.decoders[index].decode_trailers(&mut trailers, &mut self.ctx) {
                FilterTrailersStatus::Continue => {}
                FilterTrailersStatus::StopIteration => {
                    self.decode.stopped_at = Some((index, StopKind::Trailers));
                    self.decode.pending_trailers = Some(trailers);
                    return IterationOutcome::Suspended;
                }
            }
        }
        self.finish_decode();
        IterationOutcome::Completed
    }

    /// resume a decoder chain halted by `StopIteration*`
    pub fn continue_decoding(&mut self, sink: &mut dyn EncodeSink) -> IterationOutcome {
        let outcome = self.run_continue_decoding();
        self.drain_deferred(sink);
        outcome
    }

    fn run_continue_decoding(&mut self) -> IterationOutcome {
        let Some((boundary, kind)) = self.decode.stopped_at.take() else {
            return IterationOutcome::Completed;
        };
        if self.decode.aborted {
            return IterationOutcome::Completed;
        }
        // finish the headers walk first when that is what stopped
        if kind == StopKind::Headers {
            if self.run_decode_headers(boundary + 1) == IterationOutcome::Suspended {
                return IterationOutcome::Suspended;
            }
        }
        // the stopping filter consumed the data it stopped on; a headers
        // stop means it has seen nothing yet
        let data_start = match kind {
            StopKind::Headers => boundary,
            StopKind::Data | StopKind::DataNoBuffer => boundary + 1,
            StopKind::Trailers => boundary + 1,
        };
        if kind != StopKind::Trailers
            && (!self.decode.pending_data.is_empty() || self.decode.pending_data_end)
        {
            let mut data = self.decode.pending_data.take_all();
            let end = self.decode.pending_data_end && self.decode.pending_trailers.is_none();
            self.decode.pending_data_end = false;
            match self.walk_decode_data(&mut data, end, data_start, self.decoders.len()) {
                WalkResult::Completed => {
                    if end {
                        self.finish_decode();
                        return IterationOutcome::Completed;
                    }
                }
                WalkResult::Stopped | WalkResult::Abort => return IterationOutcome::Suspended,
            }
        }
        if let Some(trailers) = self.decode.pending_trailers.take() {
            let start = if kind == StopKind::Trailers {
                boundary + 1
            } else {
                0
            };
            return self.run_decode_trailers(trailers, start);
        }
        if self.decode.end_stream_seen && !self.decode.completed {
            self.finish_decode();
        }
        IterationOutcome::Completed
    }

    fn finish_decode(&mut self) {
        if self.decode.completed {
            return;
        }
        self.decode.completed = true;
        self.ctx.info.on_request_complete();
        for filter in self.decoders.iter_mut() {
            filter.decode_complete(&mut self.ctx);
        }
    }

    fn overflow_decode_buffer(&mut self) {
        tracing::debug!(
            stream = self.ctx.info.stream_id,
            limit = self.buffer_limit,
            "decoder buffer limit exceeded"
        );
        self.decode.aborted = true;
        self.ctx.send_local_reply(LocalReply::new(
            StatusCode::PAYLOAD_TOO_LARGE,
            "request-payload-too-large",
        ));
    }

    // ---------------------------------------------------------- encode --

    pub fn encode_1xx_headers(&mut self, headers: HeaderMap, sink: &mut dyn EncodeSink) {
        sink.encode_1xx_headers(&headers);
    }

    pub fn encode_headers(
        &mut self,
        headers: HeaderMap,
        end_stream: bool,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        self.encode.headers = Some(headers);
        self.encode.headers_end_stream = end_stream;
        self.encode.end_stream_seen = end_stream;
        let outcome = self.run_encode_headers(0, sink);
        self.drain_deferred(sink);
        outcome
    }

    fn run_encode_headers(&mut self, start: usize, sink: &mut dyn EncodeSink) -> IterationOutcome {
        let mut headers = match self.encode.headers.take() {
            Some(headers) => headers,
            None => return IterationOutcome::Completed,
        };
        let end_of_headers_stream = self.encode.headers_end_stream;
        let count = self.encoders.len();
        for logical in start..count {
            if self.encode.aborted || self.ctx.pending_local_reply.is_some() {
                break;
            }
            // encoder filters run in reverse insertion order
            let physical = count - 1 - logical;
            let status = self.encoders[physical].encode_headers(
                &mut headers,
                end_of_headers_stream,
                &mut self.ctx,
            );
            if status == FilterHeadersStatus::StopIteration {
                self.encode.stopped_at = Some((logical, StopKind::Headers));
                self.encode.headers = Some(headers);
                return IterationOutcome::Suspended;
            }
        }
        self.deliver_response_headers(headers, end_of_headers_stream, sink);
        IterationOutcome::Completed
    }

    fn deliver_response_headers(
        &mut self,
        headers: HeaderMap,
        end_stream: bool,
        sink: &mut dyn EncodeSink,
    ) {
        // the chargeable status is whatever survived the filters
        self.ctx.info.response_code = headers.status();
        self.non_1xx_headers_encoded = true;
        self.encode.headers_delivered = true;
        sink.encode_headers(&headers, end_stream);
        self.encode.headers = Some(headers);
        if end_stream {
            self.finish_encode();
        }
    }

    pub fn encode_data(
        &mut self,
        data: Bytes,
        end_stream: bool,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        self.encode.end_stream_seen |= end_stream;
        let outcome = self.run_encode_data(data, end_stream, sink);
        self.drain_deferred(sink);
        outcome
    }

    fn run_encode_data(
        &mut self,
        mut data: Bytes,
        end_stream: bool,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        if self.encode.aborted || self.encode_ended {
            return IterationOutcome::Completed;
        }
        match self.encode.stopped_at {
            Some((boundary, StopKind::Headers)) | Some((boundary, StopKind::Trailers)) => {
                if self.observe_encode_data(&mut data, end_stream, boundary) {
                    return IterationOutcome::Suspended;
                }
                if self.encode.pending_data.len() + data.len() > self.buffer_limit {
                    self.overflow_encode_buffer();
                    return IterationOutcome::Suspended;
                }
                self.encode.pending_data.append(data);
                self.encode.pending_data_end |= end_stream;
                IterationOutcome::Suspended
            }
            Some((boundary, _)) => {
                if self.observe_encode_data(&mut data, end_stream, boundary) {
                    return IterationOutcome::Suspended;
                }
                let physical = self.encoders.len() - 1 - boundary;
                match self.encoders[physical].encode_data(&mut data, end_stream, &mut self.ctx) {
                    FilterDataStatus::Continue => {
                        self.encode.pending_data.append(std::mem::take(&mut data));
                        self.encode.pending_data_end |= end_stream;
                        self.encode.stopped_at = Some((boundary, StopKind::Data));
                        self.run_continue_encoding(sink)
                    }
                    FilterDataStatus::StopIterationAndBuffer => {
                        if self.encode.pending_data.len() + data.len() > self.buffer_limit {
                            self.overflow_encode_buffer();
                            return IterationOutcome::Suspended;
                        }
                        self.encode.stopped_at = Some((boundary, StopKind::Data));
                        self.encode.pending_data.append(data);
                        self.encode.pending_data_end |= end_stream;
                        IterationOutcome::Suspended
                    }
                    FilterDataStatus::StopIterationNoBuffer => {
                        self.encode.stopped_at = Some((boundary, StopKind::DataNoBuffer));
                        self.encode.pending_data_end |= end_stream;
                        IterationOutcome::Suspended
                    }
                }
            }
            None => match self.walk_encode_data(&mut data, end_stream, 0, self.encoders.len()) {
                WalkResult::Completed => {
                    sink.encode_data(data, end_stream);
                    if end_stream {
                        self.finish_encode();
                    }
                    IterationOutcome::Completed
                }
                WalkResult::Stopped | WalkResult::Abort => IterationOutcome::Suspended,
            },
        }
    }

    /// encode-side twin of `observe_decode_data`, logical order
    fn observe_encode_data(&mut self, data: &mut Bytes, end_stream: bool, end: usize) -> bool {
        let count = self.encoders.len();
        for logical in 0..end {
            if self.encode.aborted || self.ctx.pending_local_reply.is_some() {
                return true;
            }
            let physical = count - 1 - logical;
            let status = self.encoders[physical].encode_data(data, end_stream, &mut self.ctx);
            if status != FilterDataStatus::Continue {
                tracing::debug!(filter = logical, "ignoring nested data stop while suspended");
            }
        }
        false
    }

    fn walk_encode_data(
        &mut self,
        data: &mut Bytes,
        end_stream: bool,
        start: usize,
        end: usize,
    ) -> WalkResult {
        let count = self.encoders.len();
        for logical in start..end {
            if self.encode.aborted || self.ctx.pending_local_reply.is_some() {
                return WalkResult::Abort;
            }
            let physical = count - 1 - logical;
            match self.encoders[physical].encode_data(data, end_stream, &mut self.ctx) {
                FilterDataStatus::Continue => {}
                FilterDataStatus::StopIterationAndBuffer => {
                    if data.len() > self.buffer_limit {
                        self.overflow_encode_buffer();
                        return WalkResult::Abort;
                    }
                    self.encode.stopped_at = Some((logical, StopKind::Data));
                    self.encode.pending_data.append(std::mem::take(data));
                    self.encode.pending_data_end |= end_stream;
                    return WalkResult::Stopped;
                }
                FilterDataStatus::StopIterationNoBuffer => {
                    self.encode.stopped_at = Some((logical, StopKind::DataNoBuffer));
                    self.encode.pending_data_end |= end_stream;
                    return WalkResult::Stopped;
                }
            }
        }
        WalkResult::Completed
    }

    pub fn encode_trailers(
        &mut self,
        trailers: HeaderMap,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        self.encode.end_stream_seen = true;
        let outcome = if self.encode.stopped() || self.encode.aborted {
            self.encode.pending_trailers = Some(trailers);
            IterationOutcome::Suspended
        } else {
            self.run_encode_trailers(trailers, 0, sink)
        };
        self.drain_deferred(sink);
        outcome
    }

    fn run_encode_trailers(
        &mut self,
        mut trailers: HeaderMap,
        start: usize,
        sink: &mut dyn EncodeSink,
    ) -> IterationOutcome {
        let count = self.encoders.len();
        for logical in start..count {
            if self.encode.aborted || self.ctx.pending_local_reply.is_some() {
                return IterationOutcome::Suspended;
            }
            let physical = count - 1 - logical;
            match self.encoders[physical].encode_trailers(&mut trailers, &mut self.ctx) {
                FilterTrailersStatus::Continue => {}
                FilterTrailersStatus::StopIteration => {
                    self.encode.stopped_at = Some((logical, StopKind::Trailers));
                    self.encode.pending_trailers = Some(trailers);
                    return IterationOutcome::Suspended;
                }
            }
        }
        sink.encode_trailers(&trailers);
        self.finish_encode();
        IterationOutcome::Completed
    }

    /// resume an encoder chain halted by `StopIteration*`
    pub fn continue_encoding(&mut self, sink: &mut dyn EncodeSink) -> IterationOutcome {
        let outcome = self.run_continue_encoding(sink);
        self.drain_deferred(sink);
        outcome
    }

    fn run_continue_encoding(&mut self, sink: &mut dyn EncodeSink) -> IterationOutcome {
        let Some((boundary, kind)) = self.encode.stopped_at.take() else {
            return IterationOutcome::Completed;
        };
        if self.encode.aborted {
            return IterationOutcome::Completed;
        }
        if kind == StopKind::Headers {
            if self.run_encode_headers(boundary + 1, sink) == IterationOutcome::Suspended {
                return IterationOutcome::Suspended;
            }
        }
        let data_start = match kind {
            StopKind::Headers => boundary,
            _ => boundary + 1,
        };
        if kind != StopKind::Trailers
            && (!self.encode.pending_data.is_empty() || self.encode.pending_data_end)
        {
            let mut data = self.encode.pending_data.take_all();
            let end = self.encode.pending_data_end && self.encode.pending_trailers.is_none();
            self.encode.pending_data_end = false;
            match self.walk_encode_data(&mut data, end, data_start, self.encoders.len()) {
                WalkResult::Completed => {
                    sink.encode_data(data, end);
                    if end {
                        self.finish_encode();
                        return IterationOutcome::Completed;
                    }
                }
                WalkResult::Stopped | WalkResult::Abort => return IterationOutcome::Suspended,
            }
        }
        if let Some(trailers) = self.encode.pending_trailers.take() {
            let start = if kind == StopKind::Trailers {
                boundary + 1
            } else {
                0
            };
            return self.run_encode_trailers(trailers, start, sink);
        }
        IterationOutcome::Completed
    }

    fn finish_encode(&mut self) {
        if self.encode_ended {
            return;
        }
        self.encode_ended = true;
        self.ctx.info.on_response_complete();
        for filter in self.encoders.iter_mut() {
            filter.encode_complete(&mut self.ctx);
        }
    }

    fn overflow_encode_buffer(&mut self) {
        tracing::debug!(
            stream = self.ctx.info.stream_id,
            limit = self.buffer_limit,
            "encoder buffer limit exceeded"
        );
        self.encode.aborted = true;
        self.ctx.send_local_reply(LocalReply::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "response-payload-too-large",
        ));
    }

    // ----------------------------------------------------- local reply --

    /// synthesize a response; encoded on the spot
    pub fn send_local_reply(&mut self, reply: LocalReply, sink: &mut dyn EncodeSink) {
        self.ctx.send_local_reply(reply);
        self.drain_deferred(sink);
    }

    fn drain_deferred(&mut self, sink: &mut dyn EncodeSink) {
        let Some(reply) = self.ctx.pending_local_reply.take() else {
            return;
        };
        self.process_local_reply(reply, sink);
    }

    fn process_local_reply(&mut self, reply: LocalReply, sink: &mut dyn EncodeSink) {
        self.ctx.info.response_code_details = Some(reply.details.clone());

        // sending a second response is impossible, reset instead
        if self.non_1xx_headers_encoded {
            tracing::debug!(
                stream = self.ctx.info.stream_id,
                details = %reply.details,
                "local reply after response started, resetting"
            );
            self.ctx.reset_requested = Some(StreamResetReason::LocalReset);
            return;
        }

        let data = LocalReplyData {
            code: reply.code,
            details: reply.details.clone(),
        };
        let mut reset_after = false;
        for filter in self.decoders.iter_mut() {
            if filter.on_local_reply(&data) == LocalReplyAction::ContinueAndResetStream {
                reset_after = true;
            }
        }
        for filter in self.encoders.iter_mut() {
            if filter.on_local_reply(&data) == LocalReplyAction::ContinueAndResetStream {
                reset_after = true;
            }
        }
        if reset_after {
            self.ctx.reset_requested = Some(StreamResetReason::LocalReset);
            return;
        }

        self.decode.aborted = true;
        let request_headers = self
            .ctx
            .request_headers
            .as_ref()
            .or(self.decode.headers.as_ref());
        let (headers, body) = local_reply::build_response(
            &reply,
            request_headers,
            self.local_reply_policy.as_ref(),
            self.is_head_request,
        );

        let headers_seen = self.ctx.request_headers.is_some() || self.decode.headers.is_some();
        if !headers_seen {
            // nothing decoded yet: answer straight past the encoder chain
            self.ctx.info.response_code = headers.status();
            self.non_1xx_headers_encoded = true;
            match body {
                Some(body) if !body.is_empty() => {
                    sink.encode_headers(&headers, false);
                    sink.encode_data(body, true);
                }
                _ => sink.encode_headers(&headers, true),
            }
            self.finish_encode();
            return;
        }

        // run it through the encoder filters like any other response
        self.encode.aborted = false;
        self.encode.stopped_at = None;
        match body {
            Some(body) if !body.is_empty() => {
                self.encode.end_stream_seen = false;
                self.encode.headers_end_stream = false;
                self.encode.headers = Some(headers);
                if self.run_encode_headers(0, sink) == IterationOutcome::Completed {
                    self.run_encode_data(body, true, sink);
                }
            }
            _ => {
                self.encode.end_stream_seen = true;
                self.encode.headers_end_stream = true;
                self.encode.headers = Some(headers);
                self.run_encode_headers(0, sink);
            }
        }
    }

    // -------------------------------------------------------- teardown --

    pub fn on_stream_reset(&mut self, reason: StreamResetReason) {
        tracing::debug!(stream = self.ctx.info.stream_id, ?reason, "stream reset");
        self.ctx.info.on_downstream_reset();
        self.decode.aborted = true;
        self.encode.aborted = true;
    }

    /// run `on_destroy` on every filter exactly once
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;
        for filter in self.decoders.iter_mut() {
            filter.on_destroy();
        }
        for filter in self.encoders.iter_mut() {
            filter.on_destroy();
        }
        // request-scoped state dies with the stream
        self.ctx.info.filter_state.clear_request_scope();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkResult {
    Completed,
    Stopped,
    Abort,
}
