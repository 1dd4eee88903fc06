use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;

use crate::dfp::filter::ClusterLoadSlot;
use crate::error::StreamResetReason;
use crate::filter::manager::FilterManager;
use crate::proto::{StreamCallbackHelper, StreamId};
use crate::router::filter::RouterExchange;
use crate::router::upstream::UpstreamEvent;

static NEXT_STREAM_ID: AtomicU64 = AtomicU64::new(1);

pub fn next_stream_id() -> StreamId {
    NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed)
}

/// rendezvous points between a stream's filters and its driver
///
/// filters park work here (an upstream intent, a cluster-load waiter);
/// the connection driver picks it up after the chain call unwinds.
pub struct StreamAgenda {
    pub router: Arc<Mutex<RouterExchange>>,
    pub cluster_load: ClusterLoadSlot,
}

impl StreamAgenda {
    pub fn new() -> Arc<Self> {
        Arc::new(StreamAgenda {
            router: Arc::new(Mutex::new(RouterExchange::default())),
            cluster_load: ClusterLoadSlot::default(),
        })
    }
}

/// one request/response cycle owned by the connection manager
pub struct ActiveStream {
    pub id: StreamId,
    /// built when request headers arrive (the chain may depend on them)
    pub fm: Option<FilterManager>,
    pub agenda: Arc<StreamAgenda>,
    /// the codec finished writing the response
    pub codec_saw_local_complete: bool,
    /// torn down by the proxy itself, not by peer behavior
    pub is_internally_destroyed: bool,
    pub upstream_task: Option<JoinHandle<()>>,
    pub upstream_events: Option<UnboundedReceiver<UpstreamEvent>>,
    /// lifecycle fan-out for parties watching this stream
    pub callbacks: StreamCallbackHelper,
}

impl ActiveStream {
    pub fn new(id: StreamId) -> Self {
        ActiveStream {
            id,
            fm: None,
            agenda: StreamAgenda::new(),
            codec_saw_local_complete: false,
            is_internally_destroyed: false,
            upstream_task: None,
            upstream_events: None,
            callbacks: StreamCallbackHelper::new(),
        }
    }

    pub fn notify_reset(&mut self, reason: StreamResetReason) {
        self.callbacks.run_reset_callbacks(reason);
    }

    pub fn fm(&mut self) -> &mut FilterManager {
        self.fm.as_mut().expect("filter chain not built yet")
    }

    /// the stream never got a chargeable response on the wire
    pub fn is_premature(&self) -> bool {
        match &self.fm {
            Some(fm) => fm.info().response_code.is_none(),
            None => true,
        }
    }

    /// both sides are finished; safe to tear down
    pub fn finished(&self) -> bool {
        match &self.fm {
            Some(fm) => fm.encode_completed() && self.codec_saw_local_complete,
            None => false,
        }
    }

    pub fn abort_upstream(&mut self) {
        if let Some(task) = self.upstream_task.take() {
            task.abort();
        }
        self.upstream_events = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_ids_are_unique() {
        let a = next_stream_id();
        let b = next_stream_id();
        assert_ne!(a, b);
    }

    #[test]
    fn fresh_stream_counts_as_premature() {
        let stream = ActiveStream::new(next_stream_id());
        assert!(stream.is_premature());
        assert!(!stream.finished());
    }
}
