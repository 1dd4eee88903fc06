use bytes::Bytes;

use crate::error::StreamResetReason;
use crate::headers::HeaderMap;

/// wire protocol negotiated for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http10,
    Http11,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }
}

/// tunables for an http/1 connection
#[derive(Debug, Clone)]
pub struct CodecSettings {
    pub allow_absolute_url: bool,
    pub accept_http_10: bool,
    pub allow_chunked_length: bool,
    pub stream_error_on_invalid_http_message: bool,
    pub enable_trailers: bool,
    pub max_headers_kb: usize,
    pub max_headers_count: usize,
}

impl Default for CodecSettings {
    fn default() -> Self {
        CodecSettings {
            allow_absolute_url: true,
            accept_http_10: false,
            allow_chunked_length: false,
            stream_error_on_invalid_http_message: false,
            enable_trailers: false,
            max_headers_kb: 60,
            max_headers_count: 100,
        }
    }
}

/// id of one request/response exchange on a connection
pub type StreamId = u64;

/// events a server connection pushes while decoding requests
///
/// `new_stream` hands back the id the remaining events are tagged with.
/// exactly one of the end-of-message shapes fires per stream: headers with
/// `end_stream`, a final empty data frame, or trailers.
pub trait ServerCodecCallbacks {
    fn new_stream(&mut self) -> StreamId;
    fn decode_headers(&mut self, stream: StreamId, headers: HeaderMap, end_stream: bool);
    fn decode_data(&mut self, stream: StreamId, data: Bytes, end_stream: bool);
    fn decode_trailers(&mut self, stream: StreamId, trailers: HeaderMap);
    /// the server name extracted from an absolute request target
    fn set_requested_server_name(&mut self, _name: &str) {}
}

/// events a client connection pushes while decoding the response
pub trait ResponseDecoder: Send {
    fn decode_1xx_headers(&mut self, headers: HeaderMap);
    fn decode_headers(&mut self, headers: HeaderMap, end_stream: bool);
    fn decode_data(&mut self, data: Bytes, end_stream: bool);
    fn decode_trailers(&mut self, trailers: HeaderMap);
}

/// lifecycle events observed by parties attached to a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamEvent {
    Reset(StreamResetReason),
    AboveWriteBufferHighWatermark,
    BelowWriteBufferLowWatermark,
}

type StreamEventFn = Box<dyn FnMut(StreamEvent) + Send>;

/// fan-out helper for stream lifecycle callbacks
///
/// reset fires at most once; watermark events repeat. callbacks added
/// while firing are deferred to the next event, matching the guard the
/// codec needs when a callback registers another during reset.
#[derive(Default)]
pub struct StreamCallbackHelper {
    callbacks: Vec<(u64, StreamEventFn)>,
    pending: Vec<(u64, StreamEventFn)>,
    next_id: u64,
    reset_fired: bool,
    firing: bool,
}

impl StreamCallbackHelper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F>(&mut self, callback: F) -> u64
    where
        F: FnMut(StreamEvent) + Send + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        let slot = (id, Box::new(callback) as StreamEventFn);
        if self.firing {
            self.pending.push(slot);
        } else {
            self.callbacks.push(slot);
        }
        id
    }

    pub fn remove(&mut self, id: u64) {
        self.callbacks.retain(|(cb_id, _)| *cb_id != id);
        self.pending.retain(|(cb_id, _)| *cb_id != id);
    }

    pub fn run_reset_callbacks(&mut self, reason: StreamResetReason) {
        if self.reset_fired {
            return;
        }
        self.reset_fired = true;
        self.fire(StreamEvent::Reset(reason));
    }

    pub fn run_high_watermark_callbacks(&mut self) {
        self.fire(StreamEvent::AboveWriteBufferHighWatermark);
    }

    pub fn run_low_watermark_callbacks(&mut self) {
        self.fire(StreamEvent::BelowWriteBufferLowWatermark);
    }

    fn fire(&mut self, event: StreamEvent) {
        self.firing = true;
        for (_, callback) in self.callbacks.iter_mut() {
            callback(event);
        }
        self.firing = false;
        self.callbacks.append(&mut self.pending);
    }
}
