use std::sync::Arc;
use std::time::Instant;

use http::StatusCode;

use crate::error::ResponseFlag;
use crate::filter::state::{ConnectionState, FilterState};
use crate::proto::Protocol;
use crate::router::route::Route;

/// everything recorded about one stream's life
pub struct StreamInfo {
    pub stream_id: u64,
    pub protocol: Option<Protocol>,
    pub start_time: Instant,
    pub request_complete_time: Option<Instant>,
    pub response_complete_time: Option<Instant>,
    pub response_code: Option<StatusCode>,
    pub response_code_details: Option<String>,
    response_flags: Vec<ResponseFlag>,
    pub filter_state: FilterState,
    pub route: Option<Arc<Route>>,
    pub cluster_name: Option<String>,
    pub requested_server_name: Option<String>,
    pub downstream_reset: bool,
}

impl StreamInfo {
    pub fn new(stream_id: u64, connection_state: ConnectionState) -> Self {
        StreamInfo {
            stream_id,
            protocol: None,
            start_time: Instant::now(),
            request_complete_time: None,
            response_complete_time: None,
            response_code: None,
            response_code_details: None,
            response_flags: Vec::new(),
            filter_state: FilterState::new(connection_state),
            route: None,
            cluster_name: None,
            requested_server_name: None,
            downstream_reset: false,
        }
    }

    pub fn set_response_flag(&mut self, flag: ResponseFlag) {
        if !self.response_flags.contains(&flag) {
            self.response_flags.push(flag);
        }
    }

    pub fn has_response_flag(&self, flag: ResponseFlag) -> bool {
        self.response_flags.contains(&flag)
    }

    pub fn response_flags(&self) -> &[ResponseFlag] {
        &self.response_flags
    }

    pub fn on_request_complete(&mut self) {
        self.request_complete_time = Some(Instant::now());
    }

    pub fn on_response_complete(&mut self) {
        self.response_complete_time = Some(Instant::now());
    }

    pub fn on_downstream_reset(&mut self) {
        self.downstream_reset = true;
    }
}
