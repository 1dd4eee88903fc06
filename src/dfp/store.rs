use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::{Mutex, RwLock};

use crate::cluster::info::{ClusterInfo, Host};

const HOST_CACHE_SIZE: usize = 1024;

/// bookkeeping for one on-demand sub-cluster
pub struct SubClusterInfo {
    pub info: Arc<ClusterInfo>,
    last_used: Mutex<Instant>,
}

impl SubClusterInfo {
    pub fn new(info: Arc<ClusterInfo>) -> Arc<Self> {
        Arc::new(SubClusterInfo {
            info,
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn idle_for(&self) -> Duration {
        self.last_used.lock().elapsed()
    }
}

/// shared map of live sub-clusters plus the resolved-host cache
///
/// the main task writes, workers read; the host cache is an LRU so a
/// scanning client cannot grow it without bound.
pub struct DfpClusterStore {
    sub_clusters: RwLock<HashMap<String, Arc<SubClusterInfo>>>,
    host_cache: Mutex<LruCache<String, Arc<Host>>>,
}

impl DfpClusterStore {
    pub fn new() -> Arc<Self> {
        Arc::new(DfpClusterStore {
            sub_clusters: RwLock::new(HashMap::new()),
            host_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(HOST_CACHE_SIZE).expect("nonzero cache size"),
            )),
        })
    }

    pub fn load(&self, name: &str) -> Option<Arc<SubClusterInfo>> {
        self.sub_clusters.read().get(name).cloned()
    }

    pub fn save(&self, name: String, entry: Arc<SubClusterInfo>) {
        self.sub_clusters.write().insert(name, entry);
    }

    pub fn remove(&self, name: &str) -> bool {
        self.sub_clusters.write().remove(name).is_some()
    }

    /// refresh the last-used stamp; false when the entry has been reaped
    pub fn touch(&self, name: &str) -> bool {
        match self.sub_clusters.read().get(name) {
            Some(entry) => {
                *entry.last_used.lock() = Instant::now();
                true
            }
            None => false,
        }
    }

    /// names idle longer than `ttl`
    pub fn idle_names(&self, ttl: Duration) -> Vec<String> {
        self.sub_clusters
            .read()
            .iter()
            .filter(|(_, entry)| entry.idle_for() > ttl)
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.sub_clusters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sub_clusters.read().is_empty()
    }

    pub fn cache_host(&self, key: String, host: Arc<Host>) {
        self.host_cache.lock().put(key, host);
    }

    pub fn cached_host(&self, key: &str) -> Option<Arc<Host>> {
        self.host_cache.lock().get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::info::DiscoveryType;

    fn entry(name: &str) -> Arc<SubClusterInfo> {
        SubClusterInfo::new(Arc::new(ClusterInfo::new(
            name,
            DiscoveryType::DynamicForwardProxy,
        )))
    }

    #[test]
    fn touch_tracks_liveness() {
        let store = DfpClusterStore::new();
        store.save("DFPCluster:a:80".into(), entry("DFPCluster:a:80"));
        assert!(store.touch("DFPCluster:a:80"));
        assert!(store.remove("DFPCluster:a:80"));
        assert!(!store.touch("DFPCluster:a:80"));
    }

    #[test]
    fn idle_detection() {
        let store = DfpClusterStore::new();
        store.save("DFPCluster:a:80".into(), entry("DFPCluster:a:80"));
        assert!(store.idle_names(Duration::from_secs(60)).is_empty());
        assert_eq!(store.idle_names(Duration::ZERO).len(), 1);
    }

    #[test]
    fn host_cache_round_trip() {
        let store = DfpClusterStore::new();
        let host = Host::new("DFPCluster:a:80", "a", 80);
        store.cache_host("a:80".into(), host);
        assert!(store.cached_host("a:80").is_some());
        assert!(store.cached_host("b:80").is_none());
    }
}
