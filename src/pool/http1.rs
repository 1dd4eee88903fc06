use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::timeout;

use crate::cluster::info::{ClusterInfo, Host};
use crate::cluster::ResourcePriority;
use crate::error::PoolFailureReason;
use crate::net::transport::Connect;
use crate::pool::client::{ActiveClient, ClientState, CodecClient};
use crate::proto::CodecSettings;

/// how an explicit drain behaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainBehavior {
    /// existing clients retire as their streams finish, new streams still
    /// enter the pool
    DrainExistingConnections,
    /// the pool is going away, refuse new streams too
    DrainAndDelete,
}

/// counters for observability and tests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub ready: usize,
    pub busy: usize,
    pub connecting: usize,
    pub pending: usize,
}

enum PoolAnswer {
    Ready(ActiveClient),
    Failure(PoolFailureReason, String),
}

struct PendingStream {
    id: u64,
    tx: oneshot::Sender<PoolAnswer>,
}

struct PoolState {
    ready: Vec<ActiveClient>,
    busy: usize,
    connecting: usize,
    pending: VecDeque<PendingStream>,
    next_client_id: u64,
    next_pending_id: u64,
    draining: Option<DrainBehavior>,
    idle_callbacks: Vec<Box<dyn Fn() + Send>>,
}

struct PoolShared {
    host: Arc<Host>,
    cluster: Arc<ClusterInfo>,
    priority: ResourcePriority,
    connector: Arc<dyn Connect>,
    settings: CodecSettings,
    state: Mutex<PoolState>,
}

/// pool of pre-connected http/1 clients for one `(host, priority)` bucket
///
/// a ready client attaches synchronously; otherwise the stream queues as
/// pending (bounded by the cluster's pending budget) and a connect is
/// started when the connection budget allows. dropping the future
/// returned by `new_stream` before it resolves cancels the pending entry
/// without any callback firing.
pub struct Http1Pool {
    shared: Arc<PoolShared>,
}

impl Http1Pool {
    pub fn new(
        host: Arc<Host>,
        cluster: Arc<ClusterInfo>,
        priority: ResourcePriority,
        connector: Arc<dyn Connect>,
        settings: CodecSettings,
    ) -> Self {
        Http1Pool {
            shared: Arc::new(PoolShared {
                host,
                cluster,
                priority,
                connector,
                settings,
                state: Mutex::new(PoolState {
                    ready: Vec::new(),
                    busy: 0,
                    connecting: 0,
                    pending: VecDeque::new(),
                    next_client_id: 0,
                    next_pending_id: 0,
                    draining: None,
                    idle_callbacks: Vec::new(),
                }),
            }),
        }
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.shared.host
    }

    pub fn priority(&self) -> ResourcePriority {
        self.shared.priority
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            ready: state.ready.len(),
            busy: state.busy,
            connecting: state.connecting,
            pending: state.pending.len(),
        }
    }

    /// acquire a client for one exchange
    ///
    /// resolves synchronously when a ready client exists or the budgets
    /// refuse the stream outright; otherwise waits on the pending FIFO.
    pub async fn new_stream(&self) -> Result<ClientLease, (PoolFailureReason, String)> {
        let (rx, _guard) = {
            let mut state = self.shared.state.lock();
            if state.draining == Some(DrainBehavior::DrainAndDelete) {
                return Err((PoolFailureReason::Overflow, "pool_draining".into()));
            }
            if let Some(mut client) = state.ready.pop() {
                client.state = ClientState::Busy;
                client.total_streams += 1;
                state.busy += 1;
                if !self.shared.cluster.resources.requests.try_inc() {
                    state.busy -= 1;
                    PoolShared::retire_client(&self.shared, client);
                    return Err((PoolFailureReason::Overflow, "max_requests".into()));
                }
                return Ok(ClientLease::new(client, self.shared.clone()));
            }
            if !self.shared.cluster.resources.pending_requests.try_inc() {
                tracing::debug!(host = %self.shared.host.endpoint(), "pending budget exhausted");
                return Err((PoolFailureReason::Overflow, "overflow".into()));
            }
            let id = state.next_pending_id;
            state.next_pending_id += 1;
            let (tx, rx) = oneshot::channel();
            state.pending.push_back(PendingStream { id, tx });
            PoolShared::maybe_connect(&self.shared, &mut state);
            let guard = PendingGuard {
                shared: self.shared.clone(),
                id,
                armed: true,
            };
            (rx, guard)
        };
        match rx.await {
            Ok(PoolAnswer::Ready(client)) => Ok(ClientLease::new(client, self.shared.clone())),
            Ok(PoolAnswer::Failure(reason, message)) => Err((reason, message)),
            Err(_) => Err((PoolFailureReason::Overflow, "pool_destroyed".into())),
        }
    }

    /// retire clients, optionally shutting the pool for good
    pub fn drain_connections(&self, behavior: DrainBehavior) {
        let mut state = self.shared.state.lock();
        state.draining = Some(behavior);
        for mut client in state.ready.drain(..) {
            client.state = ClientState::Draining;
            self.shared.cluster.resources.connections.dec();
        }
        let pending: Vec<_> = state.pending.drain(..).collect();
        for entry in pending {
            self.shared.cluster.resources.pending_requests.dec();
            let _ = entry
                .tx
                .send(PoolAnswer::Failure(
                    PoolFailureReason::Overflow,
                    "pool_draining".into(),
                ));
        }
        PoolShared::check_idle(&mut state);
    }

    /// runs when the pool has no work left at all
    pub fn add_idle_callback(&self, callback: Box<dyn Fn() + Send>) {
        self.shared.state.lock().idle_callbacks.push(callback);
    }

    pub fn is_idle(&self) -> bool {
        let state = self.shared.state.lock();
        state.busy == 0 && state.connecting == 0 && state.pending.is_empty()
    }
}

impl PoolShared {
    /// start connects until either budget or demand runs out
    fn maybe_connect(shared: &Arc<PoolShared>, state: &mut PoolState) {
        while state.connecting < state.pending.len()
            && shared.cluster.resources.connections.try_inc()
        {
            state.connecting += 1;
            let id = state.next_client_id;
            state.next_client_id += 1;
            let task_shared = shared.clone();
            tokio::spawn(async move {
                PoolShared::run_connect(task_shared, id).await;
            });
        }
    }

    async fn run_connect(shared: Arc<PoolShared>, id: u64) {
        tracing::debug!(host = %shared.host.endpoint(), client = id, "connecting");
        let connect = shared.connector.connect();
        let result = timeout(shared.cluster.connect_timeout, connect).await;
        let mut state = shared.state.lock();
        state.connecting -= 1;
        match result {
            Ok(Ok(stream)) => {
                let stream = shared.cluster.transport.wrap(stream);
                let mut client =
                    ActiveClient::new(id, CodecClient::new(stream, shared.settings.clone()));
                client.state = ClientState::Ready;
                PoolShared::hand_out(&shared, &mut state, client);
            }
            Ok(Err(e)) => {
                shared.cluster.resources.connections.dec();
                let reason = if e.kind() == std::io::ErrorKind::ConnectionRefused {
                    PoolFailureReason::RemoteConnectionFailure
                } else {
                    PoolFailureReason::LocalConnectionFailure
                };
                PoolShared::fail_all_pending(&shared, &mut state, reason, e.to_string());
            }
            Err(_) => {
                shared.cluster.resources.connections.dec();
                PoolShared::fail_all_pending(
                    &shared,
                    &mut state,
                    PoolFailureReason::ConnectionTimeout,
                    "connect timeout".into(),
                );
            }
        }
    }

    /// a usable client appeared: serve the queue or park it
    fn hand_out(shared: &Arc<PoolShared>, state: &mut PoolState, mut client: ActiveClient) {
        if state.draining.is_some() {
            client.state = ClientState::Draining;
            shared.cluster.resources.connections.dec();
            PoolShared::check_idle(state);
            return;
        }
        while let Some(entry) = state.pending.pop_front() {
            shared.cluster.resources.pending_requests.dec();
            if !shared.cluster.resources.requests.try_inc() {
                let _ = entry.tx.send(PoolAnswer::Failure(
                    PoolFailureReason::Overflow,
                    "max_requests".into(),
                ));
                continue;
            }
            client.state = ClientState::Busy;
            client.total_streams += 1;
            state.busy += 1;
            match entry.tx.send(PoolAnswer::Ready(client)) {
                Ok(()) => return,
                Err(PoolAnswer::Ready(returned)) => {
                    // receiver vanished between queue and send
                    state.busy -= 1;
                    shared.cluster.resources.requests.dec();
                    client = returned;
                    client.total_streams -= 1;
                }
                Err(_) => unreachable!("sent value comes back on failure"),
            }
        }
        client.state = ClientState::Ready;
        state.ready.push(client);
        PoolShared::check_idle(state);
    }

    fn fail_all_pending(
        shared: &Arc<PoolShared>,
        state: &mut PoolState,
        reason: PoolFailureReason,
        message: String,
    ) {
        tracing::debug!(host = %shared.host.endpoint(), ?reason, %message, "failing pending streams");
        let pending: Vec<_> = state.pending.drain(..).collect();
        for entry in pending {
            shared.cluster.resources.pending_requests.dec();
            let _ = entry
                .tx
                .send(PoolAnswer::Failure(reason, message.clone()));
        }
        PoolShared::check_idle(state);
    }

    fn retire_client(shared: &Arc<PoolShared>, mut client: ActiveClient) {
        client.state = ClientState::Closed;
        shared.cluster.resources.connections.dec();
    }

    fn check_idle(state: &mut PoolState) {
        if state.busy == 0 && state.connecting == 0 && state.pending.is_empty() {
            for callback in &state.idle_callbacks {
                callback();
            }
        }
    }
}

/// removes a still-queued pending stream when its waiter goes away
struct PendingGuard {
    shared: Arc<PoolShared>,
    id: u64,
    armed: bool,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut state = self.shared.state.lock();
        let before = state.pending.len();
        state.pending.retain(|entry| entry.id != self.id);
        if state.pending.len() != before {
            self.shared.cluster.resources.pending_requests.dec();
        }
    }
}

/// exclusive use of one pooled client for one exchange
///
/// `release(true)` offers the client back for reuse (refused when the
/// peer asked to close, the per-connection request budget is spent, or
/// the pool is draining); dropping the lease closes the connection.
pub struct ClientLease {
    client: Option<ActiveClient>,
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ClientLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientLease").finish_non_exhaustive()
    }
}

impl ClientLease {
    fn new(client: ActiveClient, shared: Arc<PoolShared>) -> Self {
        ClientLease {
            client: Some(client),
            shared,
        }
    }

    pub fn client(&self) -> &ActiveClient {
        self.client.as_ref().expect("lease already released")
    }

    pub fn client_mut(&mut self) -> &mut ActiveClient {
        self.client.as_mut().expect("lease already released")
    }

    pub fn host(&self) -> &Arc<Host> {
        &self.shared.host
    }

    /// hand the client back, reusable or not
    pub fn release(mut self, reuse: bool) {
        self.finish(reuse);
    }

    fn finish(&mut self, reuse: bool) {
        let Some(mut client) = self.client.take() else {
            return;
        };
        let mut state = self.shared.state.lock();
        state.busy -= 1;
        self.shared.cluster.resources.requests.dec();

        let max_requests = self.shared.cluster.max_requests_per_connection;
        let exhausted = max_requests > 0 && client.total_streams >= max_requests;
        let reusable = reuse
            && !exhausted
            && !client.codec_client.codec.saw_connection_close()
            && state.draining.is_none();
        if reusable {
            client.codec_client.codec.release_stream();
            PoolShared::hand_out(&self.shared, &mut state, client);
        } else {
            tracing::debug!(
                client = client.id,
                reuse,
                exhausted,
                "retiring upstream client"
            );
            PoolShared::retire_client(&self.shared, client);
            PoolShared::maybe_connect(&self.shared, &mut state);
            PoolShared::check_idle(&mut state);
        }
    }
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::info::DiscoveryType;
    use crate::cluster::resource::ResourceLimits;
    use futures::future::BoxFuture;
    use std::io;
    use std::sync::Mutex as StdMutex;
    use tokio::io::DuplexStream;

    /// in-memory connector; keeps the server halves alive
    struct PipeConnector {
        servers: StdMutex<Vec<DuplexStream>>,
    }

    impl PipeConnector {
        fn new() -> Arc<Self> {
            Arc::new(PipeConnector {
                servers: StdMutex::new(Vec::new()),
            })
        }
    }

    impl Connect for PipeConnector {
        fn connect(&self) -> BoxFuture<'static, io::Result<crate::net::Stream>> {
            let (client, server) = tokio::io::duplex(64 * 1024);
            self.servers.lock().unwrap().push(server);
            Box::pin(async move { Ok(Box::new(client) as crate::net::Stream) })
        }
    }

    struct RefusingConnector;
    impl Connect for RefusingConnector {
        fn connect(&self) -> BoxFuture<'static, io::Result<crate::net::Stream>> {
            Box::pin(async {
                Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    "connection refused",
                ))
            })
        }
    }

    fn cluster(limits: ResourceLimits) -> Arc<ClusterInfo> {
        Arc::new(ClusterInfo::new("test", DiscoveryType::Static).with_limits(limits))
    }

    fn pool_with(connector: Arc<dyn Connect>, limits: ResourceLimits) -> Http1Pool {
        Http1Pool::new(
            Host::new("test", "127.0.0.1", 80),
            cluster(limits),
            ResourcePriority::Default,
            connector,
            CodecSettings::default(),
        )
    }

    #[tokio::test]
    async fn connect_attach_release_reuse() {
        let pool = pool_with(PipeConnector::new(), ResourceLimits::default());
        let lease = pool.new_stream().await.expect("lease");
        assert_eq!(pool.stats().busy, 1);
        assert_eq!(lease.client().total_streams, 1);
        lease.release(true);
        let stats = pool.stats();
        assert_eq!(stats.busy, 0);
        assert_eq!(stats.ready, 1);

        // second stream attaches to the parked client without connecting
        let lease = pool.new_stream().await.expect("lease");
        assert_eq!(lease.client().total_streams, 2);
        assert_eq!(pool.stats().connecting, 0);
    }

    #[tokio::test]
    async fn drop_closes_client() {
        let pool = pool_with(PipeConnector::new(), ResourceLimits::default());
        let lease = pool.new_stream().await.expect("lease");
        drop(lease);
        let stats = pool.stats();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.busy, 0);
    }

    #[tokio::test]
    async fn pending_overflow_fails_synchronously() {
        let limits = ResourceLimits {
            max_connections: 1,
            max_pending_requests: 1,
            ..Default::default()
        };
        let pool = pool_with(PipeConnector::new(), limits);

        let first = pool.new_stream().await.expect("first lease");
        assert_eq!(pool.stats().busy, 1);

        // second waits in the single pending slot
        let second = pool.new_stream();
        tokio::pin!(second);
        assert!(futures::poll!(second.as_mut()).is_pending());
        assert_eq!(pool.stats().pending, 1);

        // third finds no budget left
        let (reason, message) = pool.new_stream().await.unwrap_err();
        assert_eq!(reason, PoolFailureReason::Overflow);
        assert_eq!(message, "overflow");

        // first finishing hands its client to the waiter
        first.release(true);
        let lease = second.await.expect("second lease");
        assert_eq!(lease.client().total_streams, 2);
    }

    #[tokio::test]
    async fn cancellation_removes_pending_entry() {
        let limits = ResourceLimits {
            max_connections: 1,
            ..Default::default()
        };
        let pool = pool_with(PipeConnector::new(), limits);
        let first = pool.new_stream().await.expect("first lease");

        {
            let second = pool.new_stream();
            tokio::pin!(second);
            assert!(futures::poll!(second.as_mut()).is_pending());
            assert_eq!(pool.stats().pending, 1);
        }
        // waiter dropped: entry gone, nothing fires later
        assert_eq!(pool.stats().pending, 0);
        first.release(true);
        assert_eq!(pool.stats().ready, 1);
    }

    #[tokio::test]
    async fn connect_failure_fails_pending() {
        let pool = pool_with(Arc::new(RefusingConnector), ResourceLimits::default());
        let (reason, message) = pool.new_stream().await.unwrap_err();
        assert_eq!(reason, PoolFailureReason::RemoteConnectionFailure);
        assert!(message.contains("refused"));
        let stats = pool.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.connecting, 0);
    }

    #[tokio::test]
    async fn max_requests_per_connection_retires() {
        let connector = PipeConnector::new();
        let mut cluster_info = ClusterInfo::new("test", DiscoveryType::Static);
        cluster_info.max_requests_per_connection = 1;
        let pool = Http1Pool::new(
            Host::new("test", "127.0.0.1", 80),
            Arc::new(cluster_info),
            ResourcePriority::Default,
            connector,
            CodecSettings::default(),
        );
        let lease = pool.new_stream().await.expect("lease");
        lease.release(true);
        // the single allowed request is spent, nothing to reuse
        assert_eq!(pool.stats().ready, 0);
    }

    #[tokio::test]
    async fn drain_and_delete_refuses_new_streams() {
        let pool = pool_with(PipeConnector::new(), ResourceLimits::default());
        let lease = pool.new_stream().await.expect("lease");
        lease.release(true);
        assert_eq!(pool.stats().ready, 1);

        pool.drain_connections(DrainBehavior::DrainAndDelete);
        assert_eq!(pool.stats().ready, 0);
        let (reason, message) = pool.new_stream().await.unwrap_err();
        assert_eq!(reason, PoolFailureReason::Overflow);
        assert_eq!(message, "pool_draining");
    }

    #[tokio::test]
    async fn drain_existing_retires_on_release() {
        let pool = pool_with(PipeConnector::new(), ResourceLimits::default());
        let lease = pool.new_stream().await.expect("lease");
        pool.drain_connections(DrainBehavior::DrainExistingConnections);
        lease.release(true);
        // draining refuses the reuse
        assert_eq!(pool.stats().ready, 0);
    }

    #[tokio::test]
    async fn idle_callback_fires() {
        let pool = pool_with(PipeConnector::new(), ResourceLimits::default());
        let fired = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = fired.clone();
        pool.add_idle_callback(Box::new(move || {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        let lease = pool.new_stream().await.expect("lease");
        lease.release(true);
        assert!(fired.load(std::sync::atomic::Ordering::SeqCst));
        assert!(pool.is_idle());
    }
}
