use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::cluster::info::{ClusterInfo, DiscoveryType, Host};
use crate::cluster::manager::{ClusterManager, ClusterUpdateListener, ThreadLocalCluster};
use crate::dfp::store::{DfpClusterStore, SubClusterInfo};

/// work posted to the main task
enum DfpCommand {
    CreateOrUpdate {
        name: String,
        host: String,
        port: u16,
    },
}

/// waits for one sub-cluster to become available
///
/// resolves `true` once the cluster-add callback lands, `false` when the
/// cluster went away instead. dropping the handle abandons the wait; the
/// completion side tolerates that.
pub struct LoadClusterEntryHandle {
    pub rx: oneshot::Receiver<bool>,
}

/// per-worker waiter book: cluster name to parked streams
///
/// registered as a cluster-update listener so cluster propagation
/// completes the right waiters.
#[derive(Default)]
pub struct DfpWorkerState {
    pending: Mutex<HashMap<String, Vec<oneshot::Sender<bool>>>>,
}

impl DfpWorkerState {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn register(&self, name: &str) -> LoadClusterEntryHandle {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry(name.to_string())
            .or_default()
            .push(tx);
        LoadClusterEntryHandle { rx }
    }

    pub fn pending_count(&self, name: &str) -> usize {
        self.pending.lock().get(name).map_or(0, Vec::len)
    }
}

impl ClusterUpdateListener for DfpWorkerState {
    fn on_cluster_add_or_update(&self, name: &str, _cluster: &Arc<ThreadLocalCluster>) {
        if let Some(waiters) = self.pending.lock().remove(name) {
            tracing::debug!(cluster = name, waiters = waiters.len(), "resuming waiters");
            for waiter in waiters {
                let _ = waiter.send(true);
            }
        }
    }

    fn on_cluster_removed(&self, name: &str) {
        if let Some(waiters) = self.pending.lock().remove(name) {
            for waiter in waiters {
                let _ = waiter.send(false);
            }
        }
    }
}

/// the dynamic-forward-proxy cluster: sub-clusters on demand
///
/// workers call `add_dynamic_cluster` and pause; the main task creates
/// the sub-cluster and the usual propagation path resumes them. a reaper
/// retires sub-clusters nobody touched for `sub_cluster_ttl`.
pub struct DfpCluster {
    store: Arc<DfpClusterStore>,
    commands: mpsc::UnboundedSender<DfpCommand>,
    sub_cluster_ttl: Duration,
}

impl DfpCluster {
    pub fn new(
        cluster_manager: Arc<ClusterManager>,
        store: Arc<DfpClusterStore>,
        sub_cluster_ttl: Duration,
    ) -> (Arc<Self>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let cluster = Arc::new(DfpCluster {
            store: store.clone(),
            commands: tx,
            sub_cluster_ttl,
        });
        let main_task = tokio::spawn(run_main_task(cluster_manager, store, rx));
        (cluster, main_task)
    }

    /// record use; false when the sub-cluster has been reaped
    pub fn touch(&self, name: &str) -> bool {
        self.store.touch(name)
    }

    pub fn store(&self) -> &Arc<DfpClusterStore> {
        &self.store
    }

    /// ask the main task for a sub-cluster; pairs with a registered waiter
    pub fn add_dynamic_cluster(&self, name: String, host: String, port: u16) {
        let _ = self.commands.send(DfpCommand::CreateOrUpdate { name, host, port });
    }

    /// periodic retirement of idle sub-clusters
    pub fn spawn_reaper(
        self: &Arc<Self>,
        cluster_manager: Arc<ClusterManager>,
        period: Duration,
    ) -> JoinHandle<()> {
        let dfp = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                for name in dfp.store.idle_names(dfp.sub_cluster_ttl) {
                    tracing::debug!(cluster = %name, "reaping idle sub-cluster");
                    dfp.store.remove(&name);
                    cluster_manager.remove_cluster(&name);
                }
            }
        })
    }
}

/// the main-task loop: creates or refreshes sub-clusters
async fn run_main_task(
    cluster_manager: Arc<ClusterManager>,
    store: Arc<DfpClusterStore>,
    mut commands: mpsc::UnboundedReceiver<DfpCommand>,
) {
    while let Some(command) = commands.recv().await {
        match command {
            DfpCommand::CreateOrUpdate { name, host, port } => {
                let cache_key = format!("{}:{}", host, port);
                let member = match store.cached_host(&cache_key) {
                    Some(member) => member,
                    None => {
                        let member = Host::with_hostname(name.clone(), host.clone(), port, host);
                        store.cache_host(cache_key, member.clone());
                        member
                    }
                };
                let entry = match store.load(&name) {
                    Some(entry) => entry,
                    None => {
                        let info = Arc::new(ClusterInfo::new(
                            name.clone(),
                            DiscoveryType::StrictDns,
                        ));
                        let entry = SubClusterInfo::new(info);
                        store.save(name.clone(), entry.clone());
                        entry
                    }
                };
                cluster_manager.add_or_update_cluster(entry.info.clone(), vec![member]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfp::sub_cluster_name;
    use crate::proto::CodecSettings;

    #[tokio::test]
    async fn cold_load_resumes_waiter() {
        let cm = ClusterManager::new(CodecSettings::default());
        let store = DfpClusterStore::new();
        let worker = DfpWorkerState::new();
        cm.add_update_listener(worker.clone());
        let (dfp, _main) = DfpCluster::new(cm.clone(), store, Duration::from_secs(60));

        let name = sub_cluster_name("x.test", 80);
        assert!(cm.get(&name).is_none());

        let handle = worker.register(&name);
        dfp.add_dynamic_cluster(name.clone(), "x.test".into(), 80);
        assert!(handle.rx.await.unwrap());

        let cluster = cm.get(&name).expect("sub-cluster installed");
        assert_eq!(cluster.hosts()[0].endpoint(), "x.test:80");
        assert!(dfp.touch(&name));
    }

    #[tokio::test]
    async fn removal_fails_waiters() {
        let cm = ClusterManager::new(CodecSettings::default());
        let worker = DfpWorkerState::new();
        cm.add_update_listener(worker.clone());

        let handle = worker.register("DFPCluster:y.test:80");
        cm.remove_cluster("DFPCluster:y.test:80");
        assert!(!handle.rx.await.unwrap());
    }

    #[tokio::test]
    async fn reaper_removes_idle() {
        let cm = ClusterManager::new(CodecSettings::default());
        let store = DfpClusterStore::new();
        let (dfp, _main) = DfpCluster::new(cm.clone(), store, Duration::ZERO);

        let name = sub_cluster_name("z.test", 443);
        dfp.add_dynamic_cluster(name.clone(), "z.test".into(), 443);
        // give the main task a turn
        tokio::task::yield_now().await;
        assert!(cm.get(&name).is_some());

        let _reaper = dfp.spawn_reaper(cm.clone(), Duration::from_millis(1));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cm.get(&name).is_none());
        assert!(!dfp.touch(&name));
    }
}
