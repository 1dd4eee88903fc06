pub mod local_reply;
pub mod manager;
pub mod pass_through;
pub mod state;
pub mod state_filter;

use bytes::Bytes;

use crate::error::ResponseFlag;
use crate::headers::HeaderMap;
use crate::filter::local_reply::LocalReply;
use crate::filter::state::FilterState;

/// iteration verdict for a headers callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterHeadersStatus {
    Continue,
    StopIteration,
}

/// iteration verdict for a data callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDataStatus {
    Continue,
    /// halt and collect incoming data until iteration resumes
    StopIterationAndBuffer,
    /// halt and discard incoming data, the filter owns it now
    StopIterationNoBuffer,
}

/// iteration verdict for a trailers callback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterTrailersStatus {
    Continue,
    StopIteration,
}

/// verdict from an `on_local_reply` hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocalReplyAction {
    Continue,
    /// finish the hooks, then reset the stream instead of replying
    ContinueAndResetStream,
}

/// what a local reply looked like when the hooks observed it
#[derive(Debug, Clone)]
pub struct LocalReplyData {
    pub code: http::StatusCode,
    pub details: String,
}

/// the manager surface a filter may touch while being called
pub trait FilterCallbacks {
    fn stream_id(&self) -> u64;
    fn stream_info(&mut self) -> &mut crate::conn::info::StreamInfo;
    fn filter_state(&mut self) -> &mut FilterState;
    fn request_headers(&mut self) -> Option<&mut HeaderMap>;
    /// ask for a synthesized response; takes effect after the current
    /// callback unwinds
    fn send_local_reply(&mut self, reply: LocalReply);
    fn set_response_flag(&mut self, flag: ResponseFlag);
    /// connection-level server name (SNI or absolute-form host)
    fn requested_server_name(&self) -> Option<&str>;
}

/// a filter observing/mutating the request path
pub trait DecoderFilter: Send {
    fn decode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        FilterHeadersStatus::Continue
    }

    fn decode_data(
        &mut self,
        _data: &mut Bytes,
        _end_stream: bool,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterDataStatus {
        FilterDataStatus::Continue
    }

    fn decode_trailers(
        &mut self,
        _trailers: &mut HeaderMap,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }

    /// the request side has fully arrived
    fn decode_complete(&mut self, _callbacks: &mut dyn FilterCallbacks) {}

    fn on_local_reply(&mut self, _reply: &LocalReplyData) -> LocalReplyAction {
        LocalReplyAction::Continue
    }

    fn on_destroy(&mut self) {}
}

/// a filter observing/mutating the response path
pub trait EncoderFilter: Send {
    fn encode_headers(
        &mut self,
        _headers: &mut HeaderMap,
        _end_stream: bool,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        FilterHeadersStatus::Continue
    }

    fn encode_data(
        &mut self,
        _data: &mut Bytes,
        _end_stream: bool,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterDataStatus {
        FilterDataStatus::Continue
    }

    fn encode_trailers(
        &mut self,
        _trailers: &mut HeaderMap,
        _callbacks: &mut dyn FilterCallbacks,
    ) -> FilterTrailersStatus {
        FilterTrailersStatus::Continue
    }

    /// the response side has fully gone out
    fn encode_complete(&mut self, _callbacks: &mut dyn FilterCallbacks) {}

    fn on_local_reply(&mut self, _reply: &LocalReplyData) -> LocalReplyAction {
        LocalReplyAction::Continue
    }

    fn on_destroy(&mut self) {}
}

/// a filter registered on both sides through one shared instance
pub struct SharedFilter<F>(std::sync::Arc<parking_lot::Mutex<F>>);

impl<F> SharedFilter<F> {
    pub fn pair(filter: F) -> (SharedFilter<F>, SharedFilter<F>) {
        let shared = std::sync::Arc::new(parking_lot::Mutex::new(filter));
        (SharedFilter(shared.clone()), SharedFilter(shared))
    }
}

impl<F: DecoderFilter + Send> DecoderFilter for SharedFilter<F> {
    fn decode_headers(
        &mut self,
        headers: &mut HeaderMap,
        end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        self.0.lock().decode_headers(headers, end_stream, callbacks)
    }
    fn decode_data(
        &mut self,
        data: &mut Bytes,
        end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterDataStatus {
        self.0.lock().decode_data(data, end_stream, callbacks)
    }
    fn decode_trailers(
        &mut self,
        trailers: &mut HeaderMap,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterTrailersStatus {
        self.0.lock().decode_trailers(trailers, callbacks)
    }
    fn decode_complete(&mut self, callbacks: &mut dyn FilterCallbacks) {
        self.0.lock().decode_complete(callbacks)
    }
    fn on_local_reply(&mut self, reply: &LocalReplyData) -> LocalReplyAction {
        self.0.lock().on_local_reply(reply)
    }
    fn on_destroy(&mut self) {
        self.0.lock().on_destroy()
    }
}

impl<F: EncoderFilter + Send> EncoderFilter for SharedFilter<F> {
    fn encode_headers(
        &mut self,
        headers: &mut HeaderMap,
        end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        self.0.lock().encode_headers(headers, end_stream, callbacks)
    }
    fn encode_data(
        &mut self,
        data: &mut Bytes,
        end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterDataStatus {
        self.0.lock().encode_data(data, end_stream, callbacks)
    }
    fn encode_trailers(
        &mut self,
        trailers: &mut HeaderMap,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterTrailersStatus {
        self.0.lock().encode_trailers(trailers, callbacks)
    }
    fn encode_complete(&mut self, callbacks: &mut dyn FilterCallbacks) {
        self.0.lock().encode_complete(callbacks)
    }
    fn on_local_reply(&mut self, reply: &LocalReplyData) -> LocalReplyAction {
        self.0.lock().on_local_reply(reply)
    }
    fn on_destroy(&mut self) {
        self.0.lock().on_destroy()
    }
}
