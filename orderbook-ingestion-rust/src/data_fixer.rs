use crate::config::FixerConfig;
use crate::pipeline::{AuxBatchedDataStorage, BatchedDataStorage};
use crate::utils::sleep_or_cancel;
use crate::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span};
use tracing_futures::Instrument;

/// Moves batches stranded in local fallback storages back into the primary storage.
///
/// A batch leaves its auxiliary storage only after the primary storage accepted it. A crash between the
/// two steps means the batch is moved again on the next pass, so the primary storage may receive it twice.
pub struct DataFixer<T> {
    data_type: String,
    main_storage: Arc<dyn BatchedDataStorage<T>>,
    aux_storages: Vec<Arc<dyn AuxBatchedDataStorage<T>>>,
    poll_delay: Duration,
    idle_sleep: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl<T: Send + Sync + 'static> DataFixer<T> {
    pub fn new(
        data_type: impl Into<String>,
        main_storage: Arc<dyn BatchedDataStorage<T>>,
        aux_storages: Vec<Arc<dyn AuxBatchedDataStorage<T>>>,
        cfg: &FixerConfig,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            main_storage,
            aux_storages,
            poll_delay: Duration::from_secs(cfg.poll_delay_secs),
            idle_sleep: Duration::from_secs(cfg.idle_sleep_secs),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub async fn start(&self) {
        let span = info_span!("fixer", data_type = %self.data_type);
        self.tracker.track_future(self.run().instrument(span)).await
    }

    async fn run(&self) {
        info!("started over {} auxiliary storages", self.aux_storages.len());
        while sleep_or_cancel(self.poll_delay, &self.shutdown).await {
            let moved = match self.fix_pass().await {
                Ok(moved) => moved,
                Err(e) => {
                    error!("fix pass aborted: {}", e);
                    0
                }
            };
            if moved == 0 && !sleep_or_cancel(self.idle_sleep, &self.shutdown).await {
                break;
            }
        }
        info!("stopped");
    }

    /// Moves at most one unit of work from each auxiliary storage. Returns how many were moved.
    /// The first failure aborts the pass and leaves the failing unit where it was.
    pub async fn fix_pass(&self) -> Result<usize> {
        let mut moved = 0;
        for (i, storage) in self.aux_storages.iter().enumerate() {
            if self.shutdown.is_cancelled() {
                break;
            }
            let Some(pending) = storage.get_with_delete_callback().await? else {
                debug!("no {} data in storage #{}", self.data_type, i);
                continue;
            };
            let rows = pending.data.len();
            self.main_storage.save(&pending.data).await?;
            pending.delete().await?;
            info!("moved {} {} rows from storage #{} to the primary storage", rows, self.data_type, i);
            moved += 1;
        }
        Ok(moved)
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
