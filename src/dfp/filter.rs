use std::sync::Arc;

use parking_lot::Mutex;

use crate::cluster::manager::ClusterManager;
use crate::dfp::cluster::{DfpCluster, DfpWorkerState, LoadClusterEntryHandle};
use crate::dfp::sub_cluster_name;
use crate::filter::state::{keys, Lifespan, Mutability};
use crate::filter::{DecoderFilter, FilterCallbacks, FilterHeadersStatus};
use crate::headers::{values, HeaderMap};

/// where a paused stream parks its cluster-load waiter for the driver
pub type ClusterLoadSlot = Arc<Mutex<Option<LoadClusterEntryHandle>>>;

/// derives the sub-cluster for a request from its authority
///
/// cache hit: record the touch and keep iterating. miss: post a
/// create-or-update to the main task, park the waiter in the slot and
/// stop the chain; the driver resumes it once the cluster lands.
pub struct DfpFilter {
    dfp: Arc<DfpCluster>,
    cluster_manager: Arc<ClusterManager>,
    worker: Arc<DfpWorkerState>,
    load_slot: ClusterLoadSlot,
}

impl DfpFilter {
    pub fn new(
        dfp: Arc<DfpCluster>,
        cluster_manager: Arc<ClusterManager>,
        worker: Arc<DfpWorkerState>,
        load_slot: ClusterLoadSlot,
    ) -> Self {
        DfpFilter {
            dfp,
            cluster_manager,
            worker,
            load_slot,
        }
    }
}

/// split an authority into host and port, scheme decides the default
pub fn parse_authority(authority: &str, scheme: Option<&str>) -> (String, u16) {
    let default_port = match scheme {
        Some(values::SCHEME_HTTPS) => 443,
        _ => 80,
    };
    match authority.rsplit_once(':') {
        Some((host, port)) if port.chars().all(|c| c.is_ascii_digit()) && !port.is_empty() => {
            match port.parse::<u16>() {
                Ok(port) => (host.to_ascii_lowercase(), port),
                Err(_) => (authority.to_ascii_lowercase(), default_port),
            }
        }
        _ => (authority.to_ascii_lowercase(), default_port),
    }
}

impl DecoderFilter for DfpFilter {
    fn decode_headers(
        &mut self,
        headers: &mut HeaderMap,
        _end_stream: bool,
        callbacks: &mut dyn FilterCallbacks,
    ) -> FilterHeadersStatus {
        let Some(authority) = headers.host().map(str::to_string) else {
            return FilterHeadersStatus::Continue;
        };
        let (host, port) = parse_authority(&authority, headers.scheme());

        let state = callbacks.filter_state();
        state.set(
            keys::DYNAMIC_HOST,
            host.clone(),
            Lifespan::Request,
            Mutability::ReadOnly,
        );
        state.set(
            keys::DYNAMIC_PORT,
            port,
            Lifespan::Request,
            Mutability::ReadOnly,
        );

        let name = sub_cluster_name(&host, port);
        if self.cluster_manager.get(&name).is_some() && self.dfp.touch(&name) {
            return FilterHeadersStatus::Continue;
        }

        tracing::debug!(cluster = %name, "requesting on-demand sub-cluster");
        let handle = self.worker.register(&name);
        self.dfp.add_dynamic_cluster(name, host, port);
        *self.load_slot.lock() = Some(handle);
        FilterHeadersStatus::StopIteration
    }
}
