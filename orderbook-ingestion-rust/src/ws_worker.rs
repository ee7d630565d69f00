use crate::error::IngestionError;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{BatchAuditor, DataReceiver, DataTransformator, StorageChain};
use crate::utils::{now_ms, sleep_or_cancel};
use crate::Result;
use parking_lot::Mutex;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn};
use tracing_futures::Instrument;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const RECV_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Static settings of one worker.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub data_type: String,
    pub worker_id: String,
    pub batch_size: usize,
    pub connect_timeout: Duration,
    /// Where a batch rejected by every storage is dumped. `None` disables the dump.
    pub emergency_dump_dir: Option<PathBuf>,
}

impl WorkerSettings {
    pub fn new(data_type: impl Into<String>, worker_id: impl Into<String>, batch_size: usize) -> Self {
        Self {
            data_type: data_type.into(),
            worker_id: worker_id.into(),
            batch_size: batch_size.max(1),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            emergency_dump_dir: None,
        }
    }
}

/// Turns one connected stream into stored batches: receive, transform, save through the storage chain.
pub struct WsDataProcessWorker<M, T> {
    inner: Arc<WorkerInner<M, T>>,
    run_handle: Mutex<Option<JoinHandle<()>>>,
}

struct WorkerInner<M, T> {
    settings: WorkerSettings,
    receiver: Arc<dyn DataReceiver<M>>,
    transformator: Arc<dyn DataTransformator<M, T>>,
    storages: StorageChain<T>,
    auditor: Option<Arc<dyn BatchAuditor<T>>>,
    metrics: Arc<PipelineMetrics>,
    shutdown: CancellationToken,
    saves: TaskTracker,
}

impl<M, T> WsDataProcessWorker<M, T>
where
    M: Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    pub fn new(
        settings: WorkerSettings,
        receiver: Arc<dyn DataReceiver<M>>,
        transformator: Arc<dyn DataTransformator<M, T>>,
        storages: StorageChain<T>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            inner: Arc::new(WorkerInner {
                settings,
                receiver,
                transformator,
                storages,
                auditor: None,
                metrics,
                shutdown: CancellationToken::new(),
                saves: TaskTracker::new(),
            }),
            run_handle: Mutex::new(None),
        }
    }

    pub fn with_auditor(mut self, auditor: Arc<dyn BatchAuditor<T>>) -> Self {
        // Still unshared right after construction.
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.auditor = Some(auditor);
        }
        self
    }

    pub fn id(&self) -> &str {
        &self.inner.settings.worker_id
    }

    /// Connects the receiver and launches the run loop.
    pub async fn start(&self) -> Result<()> {
        let settings = &self.inner.settings;
        tokio::time::timeout(settings.connect_timeout, self.inner.receiver.connect_ws())
            .await
            .map_err(|_| {
                IngestionError::Timeout(format!("{} connect of {}", settings.data_type, settings.worker_id))
            })??;

        let span = info_span!("worker", data_type = %settings.data_type, id = %settings.worker_id);
        let inner = self.inner.clone();
        let handle = tokio::spawn(async move { inner.run().await }.instrument(span));
        *self.run_handle.lock() = Some(handle);
        Ok(())
    }

    /// Stops the run loop, closes the receiver and waits until every dispatched save has finished.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.inner.receiver.shutdown().await;
        let handle = self.run_handle.lock().take();
        match handle {
            Some(handle) => {
                if let Err(e) = handle.await {
                    error!("worker {} run loop failed: {}", self.inner.settings.worker_id, e);
                }
            }
            None => {
                // Never started, but still drain in case saves were dispatched.
                self.inner.saves.close();
                self.inner.saves.wait().await;
            }
        }
        info!("{} worker {} stopped", self.inner.settings.data_type, self.inner.settings.worker_id);
    }
}

impl<M, T> WorkerInner<M, T>
where
    M: Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    async fn run(self: Arc<Self>) {
        info!("started");
        while !self.shutdown.is_cancelled() {
            self.clone().recv_and_save_batch().await;
        }
        self.saves.close();
        self.saves.wait().await;
        debug!("all save tasks finished");
    }

    async fn recv_and_save_batch(self: Arc<Self>) {
        let batch = match self.recv().await {
            Ok(batch) => batch,
            Err(e) => {
                if !self.shutdown.is_cancelled() {
                    self.metrics.record_recv_error();
                    error!("batch receive failed: {}", e);
                    sleep_or_cancel(RECV_ERROR_PAUSE, &self.shutdown).await;
                }
                return;
            }
        };
        self.metrics.record_received(batch.len());

        // Holes must be computed in arrival order, so this stays on the receive path.
        let holes = match &self.auditor {
            Some(auditor) => auditor.audit(&batch),
            None => Vec::new(),
        };

        self.metrics.record_save_started();
        let inner = self.clone();
        self.saves.spawn(
            async move {
                inner.save(batch).await;
                inner.metrics.record_save_ended();
            }
            .in_current_span(),
        );

        // Reporting is best effort and never holds a save back.
        if let (Some(auditor), false) = (self.auditor.clone(), holes.is_empty()) {
            self.saves.spawn(async move { auditor.report(holes).await }.in_current_span());
        }
    }

    /// Pulls messages until the transformed batch reaches the configured size.
    async fn recv(&self) -> Result<Vec<T>> {
        let batch_size = self.settings.batch_size;
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            let msg = self.receiver.recv().await?;
            let records = self.transformator.transform(msg)?;
            batch.extend(records);
        }
        Ok(batch)
    }

    async fn save(&self, batch: Vec<T>) {
        match self.storages.save(&batch).await {
            Ok(tier) => self.metrics.record_saved(tier),
            Err(e) => {
                self.metrics.record_not_saved();
                error!("{} batch of {} rows lost by every storage: {}", self.settings.data_type, batch.len(), e);
                self.dump_batch(&batch).await;
            }
        }
    }

    /// Last resort for a batch no storage accepted.
    async fn dump_batch(&self, batch: &[T]) {
        let Some(dir) = &self.settings.emergency_dump_dir else {
            return;
        };
        let path = dir.join(format!("{}_{}_{}.json", self.settings.data_type, now_ms(), uuid::Uuid::new_v4()));
        let written = match serde_json::to_vec(batch) {
            Ok(bytes) => match tokio::fs::create_dir_all(dir).await {
                Ok(()) => tokio::fs::write(&path, bytes).await.map_err(IngestionError::from),
                Err(e) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        };
        match written {
            Ok(()) => warn!("dumped {} rows to {}", batch.len(), path.display()),
            Err(e) => error!("emergency dump to {} failed, {} rows dropped: {}", path.display(), batch.len(), e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::BatchedDataStorage;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Yields sequential numbers until shut down.
    struct CountingReceiver {
        next: AtomicUsize,
        limit: usize,
        closed: CancellationToken,
    }

    impl CountingReceiver {
        fn new(limit: usize) -> Arc<Self> {
            Arc::new(Self { next: AtomicUsize::new(0), limit, closed: CancellationToken::new() })
        }
    }

    #[async_trait]
    impl DataReceiver<u32> for CountingReceiver {
        async fn connect_ws(&self) -> Result<()> {
            Ok(())
        }

        async fn recv(&self) -> Result<u32> {
            let n = self.next.fetch_add(1, Ordering::SeqCst);
            if n >= self.limit {
                self.closed.cancelled().await;
            }
            if self.closed.is_cancelled() {
                return Err(IngestionError::ReceiverClosed);
            }
            Ok(n as u32)
        }

        async fn shutdown(&self) {
            self.closed.cancel();
        }
    }

    struct RecordingStorage {
        batches: Mutex<Vec<Vec<u32>>>,
    }

    #[async_trait]
    impl BatchedDataStorage<u32> for RecordingStorage {
        async fn save(&self, batch: &[u32]) -> Result<()> {
            self.batches.lock().push(batch.to_vec());
            Ok(())
        }
    }

    struct FailingStorage;

    #[async_trait]
    impl BatchedDataStorage<u32> for FailingStorage {
        async fn save(&self, _batch: &[u32]) -> Result<()> {
            Err(IngestionError::Storage("down".into()))
        }
    }

    struct SlowStorage {
        started: Notify,
        finished: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl BatchedDataStorage<u32> for SlowStorage {
        async fn save(&self, _batch: &[u32]) -> Result<()> {
            self.started.notify_one();
            tokio::time::sleep(self.delay).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn worker(
        receiver: Arc<CountingReceiver>,
        storage: Arc<dyn BatchedDataStorage<u32>>,
        batch_size: usize,
    ) -> WsDataProcessWorker<u32, u32> {
        WsDataProcessWorker::new(
            WorkerSettings::new("numbers", "w0", batch_size),
            receiver,
            Arc::new(crate::transformators::NoChangeTransformator::<u32>::new()),
            StorageChain::new("numbers", vec![storage], Duration::from_secs(5)),
            PipelineMetrics::new(),
        )
    }

    #[tokio::test]
    async fn full_batches_are_saved_and_partial_one_is_discarded() {
        let storage = Arc::new(RecordingStorage { batches: Mutex::new(Vec::new()) });
        let w = worker(CountingReceiver::new(7), storage.clone(), 3);
        w.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        w.shutdown().await;

        let mut batches = storage.batches.lock().clone();
        batches.sort();
        assert_eq!(batches, vec![vec![0, 1, 2], vec![3, 4, 5]]);
        assert_eq!(w.inner.metrics.snapshot().saved_primary, 2);
    }

    #[tokio::test]
    async fn shutdown_waits_for_in_flight_save() {
        let storage = Arc::new(SlowStorage {
            started: Notify::new(),
            finished: AtomicUsize::new(0),
            delay: Duration::from_millis(300),
        });
        let w = worker(CountingReceiver::new(1), storage.clone(), 1);
        w.start().await.unwrap();
        storage.started.notified().await;

        w.shutdown().await;
        assert_eq!(storage.finished.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn rejected_batch_is_dumped_to_disk() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("dump");
        let mut settings = WorkerSettings::new("numbers", "w0", 2);
        settings.emergency_dump_dir = Some(dir.clone());
        let w: WsDataProcessWorker<u32, u32> = WsDataProcessWorker::new(
            settings,
            CountingReceiver::new(2),
            Arc::new(crate::transformators::NoChangeTransformator::<u32>::new()),
            StorageChain::new("numbers", vec![Arc::new(FailingStorage)], Duration::from_secs(1)),
            PipelineMetrics::new(),
        );
        w.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        w.shutdown().await;

        let files: Vec<_> = std::fs::read_dir(&dir).unwrap().collect();
        assert_eq!(files.len(), 1);
        let path = files[0].as_ref().unwrap().path();
        let dumped: Vec<u32> = serde_json::from_slice(&std::fs::read(path).unwrap()).unwrap();
        assert_eq!(dumped, vec![0, 1]);
        assert_eq!(w.inner.metrics.snapshot().not_saved, 1);
    }

    /// Flags a hole in every batch; reporting hangs far longer than any save.
    struct StalledReporter {
        reported: AtomicUsize,
    }

    #[async_trait]
    impl BatchAuditor<u32> for StalledReporter {
        fn audit(&self, batch: &[u32]) -> Vec<crate::types::DeltaHole> {
            batch
                .iter()
                .map(|&n| crate::types::DeltaHole {
                    symbol: format!("S{n}"),
                    side: crate::types::Side::Bid,
                    first_update_id: 1,
                    last_update_id: 2,
                    timestamp_ms: 0,
                    market_type: crate::types::MarketType::Spot,
                })
                .collect()
        }

        async fn report(&self, holes: Vec<crate::types::DeltaHole>) {
            for _ in holes {
                tokio::time::sleep(Duration::from_secs(15)).await;
                self.reported.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_hole_reporting_does_not_hold_back_the_save() {
        let storage = Arc::new(RecordingStorage { batches: Mutex::new(Vec::new()) });
        let auditor = Arc::new(StalledReporter { reported: AtomicUsize::new(0) });
        let w = worker(CountingReceiver::new(3), storage.clone(), 3).with_auditor(auditor.clone());
        w.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(storage.batches.lock().len(), 1);
        assert_eq!(auditor.reported.load(Ordering::SeqCst), 0);

        // Shutdown still lets the report finish.
        w.shutdown().await;
        assert_eq!(auditor.reported.load(Ordering::SeqCst), 3);
    }

    struct NeverConnects;

    #[async_trait]
    impl DataReceiver<u32> for NeverConnects {
        async fn connect_ws(&self) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
        async fn recv(&self) -> Result<u32> {
            Err(IngestionError::ReceiverClosed)
        }
        async fn shutdown(&self) {}
    }

    #[tokio::test]
    async fn start_times_out_on_hanging_connect() {
        let mut settings = WorkerSettings::new("numbers", "w0", 1);
        settings.connect_timeout = Duration::from_millis(50);
        let w: WsDataProcessWorker<u32, u32> = WsDataProcessWorker::new(
            settings,
            Arc::new(NeverConnects),
            Arc::new(crate::transformators::NoChangeTransformator::<u32>::new()),
            StorageChain::new("numbers", vec![Arc::new(FailingStorage)], Duration::from_secs(1)),
            PipelineMetrics::new(),
        );
        assert!(matches!(w.start().await, Err(IngestionError::Timeout(_))));
        w.shutdown().await;
    }
}
