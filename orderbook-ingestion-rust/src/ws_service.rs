use crate::utils::sleep_or_cancel;
use crate::workers_provider::WsDataWorkersProvider;
use crate::ws_worker::WsDataProcessWorker;
use crate::Result;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

pub const START_ATTEMPTS: usize = 3;
pub const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Immutable set of running workers. Replaced as a whole on every rebalance.
pub type Slate<M, T> = Arc<Vec<Arc<WsDataProcessWorker<M, T>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Running,
    Draining,
}

/// Keeps a pool of stream workers alive, replacing the whole pool every reconnect period.
///
/// The replacement slate is started completely before the previous one is shut down, so a symbol
/// assigned in both never goes unserved.
pub struct WsSvc<M, T> {
    data_type: String,
    workers_provider: Arc<dyn WsDataWorkersProvider<M, T>>,
    reconnect_period: Duration,
    slate: RwLock<Slate<M, T>>,
    state: Mutex<PoolState>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<M, T> WsSvc<M, T>
where
    M: Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        data_type: impl Into<String>,
        workers_provider: Arc<dyn WsDataWorkersProvider<M, T>>,
        reconnect_period: Duration,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            workers_provider,
            reconnect_period,
            slate: RwLock::new(Arc::new(Vec::new())),
            state: Mutex::new(PoolState::Stopped),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn state(&self) -> PoolState {
        *self.state.lock()
    }

    pub fn current_slate(&self) -> Slate<M, T> {
        self.slate.read().clone()
    }

    pub fn worker_ids(&self) -> Vec<String> {
        self.current_slate().iter().map(|w| w.id().to_string()).collect()
    }

    /// Builds the first slate, then rebalances every reconnect period until shut down.
    pub async fn start(&self) {
        let span = info_span!("ws_svc", data_type = %self.data_type);
        self.tracker.track_future(self.run().instrument(span)).await
    }

    async fn run(&self) {
        {
            let mut state = self.state.lock();
            if *state != PoolState::Stopped || self.shutdown.is_cancelled() {
                return;
            }
            *state = PoolState::Running;
        }
        self.update_workers().await;
        while sleep_or_cancel(self.reconnect_period, &self.shutdown).await {
            self.update_workers().await;
        }
    }

    /// Starts a fresh slate for the current symbol universe and retires the previous one.
    /// When no slate can be built the running one is kept.
    pub async fn update_workers(&self) {
        let new_slate = match self.get_and_activate_new_workers().await {
            Ok(slate) => slate,
            Err(e) => {
                error!("{} rebalance failed, keeping the current slate: {}", self.data_type, e);
                return;
            }
        };

        let old_slate = {
            let mut slate = self.slate.write();
            if self.shutdown.is_cancelled() {
                None
            } else {
                Some(std::mem::replace(&mut *slate, new_slate.clone()))
            }
        };
        match old_slate {
            Some(old_slate) => {
                info!(
                    "{} slate replaced: {} workers started, {} retiring",
                    self.data_type,
                    new_slate.len(),
                    old_slate.len()
                );
                self.shutdown_slate(&old_slate, Some(WORKER_SHUTDOWN_TIMEOUT)).await;
            }
            // Shutdown began while the slate was starting; it only knows about the current one.
            None => self.shutdown_slate(&new_slate, None).await,
        }
    }

    async fn get_and_activate_new_workers(&self) -> Result<Slate<M, T>> {
        if self.shutdown.is_cancelled() {
            return Ok(Arc::new(Vec::new()));
        }
        let workers = self.workers_provider.get_new_workers()?;
        let total = workers.len();
        let started: Vec<_> = join_all(workers.into_iter().map(|worker| self.start_worker(worker)))
            .await
            .into_iter()
            .flatten()
            .collect();
        if started.len() < total {
            warn!("{} of {} {} workers failed to start", total - started.len(), total, self.data_type);
        }
        Ok(Arc::new(started))
    }

    async fn start_worker(&self, worker: Arc<WsDataProcessWorker<M, T>>) -> Option<Arc<WsDataProcessWorker<M, T>>> {
        for attempt in 1..=START_ATTEMPTS {
            match worker.start().await {
                Ok(()) => return Some(worker),
                Err(e) => warn!("worker {} start attempt {}/{} failed: {}", worker.id(), attempt, START_ATTEMPTS, e),
            }
        }
        error!("worker {} left out of the slate", worker.id());
        worker.shutdown().await;
        None
    }

    async fn shutdown_slate(&self, slate: &Slate<M, T>, deadline: Option<Duration>) {
        join_all(slate.iter().map(|worker| async move {
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout(deadline, worker.shutdown()).await.is_err() {
                        warn!("worker {} did not stop within {:?}", worker.id(), deadline);
                    }
                }
                None => worker.shutdown().await,
            }
        }))
        .await;
    }

    /// Stops rebalancing and shuts the current slate down, waiting for every worker to drain.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        *self.state.lock() = PoolState::Draining;
        let current = std::mem::take(&mut *self.slate.write());
        debug!("need to shutdown {} {} workers", current.len(), self.data_type);
        self.shutdown_slate(&current, None).await;
        self.tracker.close();
        self.tracker.wait().await;
        *self.state.lock() = PoolState::Stopped;
        info!("{} service stopped", self.data_type);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IngestionError;
    use crate::metrics::PipelineMetrics;
    use crate::pipeline::{DataReceiver, StorageChain};
    use crate::transformators::NoChangeTransformator;
    use crate::ws_worker::WorkerSettings;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        connects: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    struct FakeReceiver {
        counters: Arc<Counters>,
        fail_connect: bool,
        closed: CancellationToken,
    }

    #[async_trait]
    impl DataReceiver<u32> for FakeReceiver {
        async fn connect_ws(&self) -> Result<()> {
            if self.fail_connect {
                return Err(IngestionError::WebSocketMessage("refused".into()));
            }
            self.counters.connects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn recv(&self) -> Result<u32> {
            self.closed.cancelled().await;
            Err(IngestionError::ReceiverClosed)
        }
        async fn shutdown(&self) {
            self.closed.cancel();
            self.counters.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeProvider {
        counters: Arc<Counters>,
        size: usize,
        failing: Vec<usize>,
        broken: std::sync::atomic::AtomicBool,
        built: AtomicUsize,
    }

    impl FakeProvider {
        fn new(size: usize, failing: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                counters: Arc::new(Counters::default()),
                size,
                failing,
                broken: Default::default(),
                built: AtomicUsize::new(0),
            })
        }
    }

    impl WsDataWorkersProvider<u32, u32> for FakeProvider {
        fn get_new_workers(&self) -> Result<Vec<Arc<WsDataProcessWorker<u32, u32>>>> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(IngestionError::InsufficientWorkers { expected: self.size, constructed: 0 });
            }
            let generation = self.built.fetch_add(1, Ordering::SeqCst);
            Ok((0..self.size)
                .map(|i| {
                    let receiver = FakeReceiver {
                        counters: self.counters.clone(),
                        fail_connect: self.failing.contains(&i),
                        closed: CancellationToken::new(),
                    };
                    Arc::new(WsDataProcessWorker::new(
                        WorkerSettings::new("test", format!("w-{generation}-{i}"), 1),
                        Arc::new(receiver),
                        Arc::new(NoChangeTransformator::<u32>::new()),
                        StorageChain::new("test", Vec::new(), Duration::from_millis(10)),
                        PipelineMetrics::new(),
                    ))
                })
                .collect())
        }
    }

    fn svc(provider: Arc<FakeProvider>) -> WsSvc<u32, u32> {
        WsSvc::new("test", provider, Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn rebalance_replaces_the_slate_after_starting_the_new_one() {
        let provider = FakeProvider::new(2, vec![]);
        let svc = svc(provider.clone());

        svc.update_workers().await;
        assert_eq!(svc.worker_ids(), vec!["w-0-0", "w-0-1"]);
        svc.update_workers().await;
        assert_eq!(svc.worker_ids(), vec!["w-1-0", "w-1-1"]);
        assert_eq!(provider.counters.connects.load(Ordering::SeqCst), 4);
        assert_eq!(provider.counters.shutdowns.load(Ordering::SeqCst), 2);

        svc.shutdown().await;
        assert_eq!(provider.counters.shutdowns.load(Ordering::SeqCst), 4);
        assert_eq!(svc.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn worker_failing_to_start_is_released_and_left_out() {
        let provider = FakeProvider::new(3, vec![1]);
        let svc = svc(provider.clone());

        svc.update_workers().await;
        assert_eq!(svc.worker_ids(), vec!["w-0-0", "w-0-2"]);
        // The failed worker's receiver was closed once after its three attempts.
        assert_eq!(provider.counters.shutdowns.load(Ordering::SeqCst), 1);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn failed_rebalance_keeps_the_running_slate() {
        let provider = FakeProvider::new(2, vec![]);
        let svc = svc(provider.clone());
        svc.update_workers().await;

        provider.broken.store(true, Ordering::SeqCst);
        svc.update_workers().await;
        assert_eq!(svc.worker_ids(), vec!["w-0-0", "w-0-1"]);
        assert_eq!(provider.counters.shutdowns.load(Ordering::SeqCst), 0);
        svc.shutdown().await;
    }

    #[tokio::test]
    async fn no_slate_is_built_after_shutdown() {
        let provider = FakeProvider::new(2, vec![]);
        let svc = Arc::new(svc(provider.clone()));
        let runner = {
            let svc = svc.clone();
            tokio::spawn(async move { svc.start().await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(svc.state(), PoolState::Running);
        assert_eq!(svc.worker_ids().len(), 2);

        svc.shutdown().await;
        runner.await.unwrap();
        svc.update_workers().await;
        assert!(svc.worker_ids().is_empty());
        assert_eq!(provider.built.load(Ordering::SeqCst), 1);
    }
}
