// orderbook-ingestion-rust/src/pipeline.rs
// Capability traits the ingestion pipeline is assembled from, and the tiered save discipline
// shared by every component that persists batches.
use crate::error::IngestionError;
use crate::types::DeltaHole;
use crate::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// Attempts made against each storage of a chain before moving to the next one.
pub const SAVE_ATTEMPTS: usize = 3;

// --- Capability Traits ---

/// A stream connection yielding raw protocol messages.
#[async_trait]
pub trait DataReceiver<M>: Send + Sync {
    async fn connect_ws(&self) -> Result<()>;

    /// Waits for the next message. Returns `ReceiverClosed` once `shutdown` was called.
    async fn recv(&self) -> Result<M>;

    async fn shutdown(&self);
}

/// Maps one raw message to zero or more domain records.
pub trait DataTransformator<M, T>: Send + Sync {
    fn transform(&self, msg: M) -> Result<Vec<T>>;
}

#[async_trait]
pub trait BatchedDataStorage<T>: Send + Sync {
    async fn save(&self, batch: &[T]) -> Result<()>;
}

pub type DeleteCallback = Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>;

/// A unit of work handed out by an auxiliary storage. The data stays in the storage until `delete` is called.
pub struct PendingBatch<T> {
    pub data: Vec<T>,
    on_delete: DeleteCallback,
}

impl<T> PendingBatch<T> {
    pub fn new(data: Vec<T>, on_delete: DeleteCallback) -> Self {
        Self { data, on_delete }
    }

    pub async fn delete(self) -> Result<()> {
        (self.on_delete)().await
    }
}

/// Local storage whose content is later moved to the primary storage by the fixer.
#[async_trait]
pub trait AuxBatchedDataStorage<T>: BatchedDataStorage<T> {
    /// Returns `None` when there is nothing left to move.
    async fn get_with_delete_callback(&self) -> Result<Option<PendingBatch<T>>>;
}

/// Inspects batches in arrival order before they are saved.
#[async_trait]
pub trait BatchAuditor<T>: Send + Sync {
    /// Runs on the receive path, so it must not block on I/O.
    fn audit(&self, batch: &[T]) -> Vec<DeltaHole>;

    /// Runs in its own task next to the save of the audited batch.
    async fn report(&self, holes: Vec<DeltaHole>);
}

// --- Tiered Storage Chain ---

/// Ordered storages tried one after another until one accepts the batch.
pub struct StorageChain<T> {
    data_type: String,
    storages: Vec<Arc<dyn BatchedDataStorage<T>>>,
    attempt_timeout: Duration,
}

impl<T> Clone for StorageChain<T> {
    fn clone(&self) -> Self {
        Self {
            data_type: self.data_type.clone(),
            storages: self.storages.clone(),
            attempt_timeout: self.attempt_timeout,
        }
    }
}

impl<T: Send + Sync> StorageChain<T> {
    pub fn new(
        data_type: impl Into<String>,
        storages: Vec<Arc<dyn BatchedDataStorage<T>>>,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            storages,
            attempt_timeout,
        }
    }

    pub fn data_type(&self) -> &str {
        &self.data_type
    }

    /// Saves `batch` to the first storage that accepts it and returns that storage's position.
    pub async fn save(&self, batch: &[T]) -> Result<usize> {
        for (tier, storage) in self.storages.iter().enumerate() {
            for attempt in 1..=SAVE_ATTEMPTS {
                let outcome = match tokio::time::timeout(self.attempt_timeout, storage.save(batch)).await {
                    Ok(res) => res,
                    Err(elapsed) => Err(elapsed.into()),
                };
                match outcome {
                    Ok(()) => {
                        if tier > 0 {
                            warn!(
                                "{} batch of {} rows saved to fallback storage #{}",
                                self.data_type,
                                batch.len(),
                                tier
                            );
                        }
                        return Ok(tier);
                    }
                    Err(e) => error!(
                        "{} save to storage #{} failed (attempt {}/{}): {}",
                        self.data_type, tier, attempt, SAVE_ATTEMPTS, e
                    ),
                }
            }
        }
        Err(IngestionError::NotSaved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingStorage {
        calls: AtomicUsize,
        fail_first: usize,
    }

    impl CountingStorage {
        fn new(fail_first: usize) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), fail_first })
        }
        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl BatchedDataStorage<u32> for CountingStorage {
        async fn save(&self, _batch: &[u32]) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(IngestionError::Storage("unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    struct HangingStorage;

    #[async_trait]
    impl BatchedDataStorage<u32> for HangingStorage {
        async fn save(&self, _batch: &[u32]) -> Result<()> {
            futures::future::pending::<()>().await;
            Ok(())
        }
    }

    fn chain(storages: Vec<Arc<dyn BatchedDataStorage<u32>>>) -> StorageChain<u32> {
        StorageChain::new("test", storages, Duration::from_millis(50))
    }

    #[tokio::test]
    async fn exhausted_chain_tries_each_storage_three_times() {
        let first = CountingStorage::new(usize::MAX);
        let second = CountingStorage::new(usize::MAX);
        let res = chain(vec![first.clone(), second.clone()]).save(&[1, 2, 3]).await;
        assert!(matches!(res, Err(IngestionError::NotSaved)));
        assert_eq!(first.calls(), 3);
        assert_eq!(second.calls(), 3);
    }

    #[tokio::test]
    async fn primary_recovering_on_last_attempt_wins() {
        let first = CountingStorage::new(2);
        let second = CountingStorage::new(0);
        let tier = chain(vec![first.clone(), second.clone()]).save(&[1]).await.unwrap();
        assert_eq!(tier, 0);
        assert_eq!(first.calls(), 3);
        assert_eq!(second.calls(), 0);
    }

    #[tokio::test]
    async fn falls_back_to_next_storage() {
        let first = CountingStorage::new(usize::MAX);
        let second = CountingStorage::new(0);
        let tier = chain(vec![first.clone(), second.clone()]).save(&[1]).await.unwrap();
        assert_eq!(tier, 1);
        assert_eq!(second.calls(), 1);
    }

    #[tokio::test]
    async fn hanging_storage_counts_as_failed_attempt() {
        let second = CountingStorage::new(0);
        let tier = chain(vec![Arc::new(HangingStorage), second.clone()]).save(&[1]).await.unwrap();
        assert_eq!(tier, 1);
    }

    #[tokio::test]
    async fn pending_batch_runs_delete_callback() {
        let deleted = Arc::new(AtomicUsize::new(0));
        let flag = deleted.clone();
        let pending = PendingBatch::new(
            vec![1u32, 2],
            Box::new(move || {
                async move {
                    flag.fetch_add(1, Ordering::SeqCst);
                    Ok::<(), IngestionError>(())
                }
                .boxed()
            }),
        );
        assert_eq!(pending.data, vec![1, 2]);
        pending.delete().await.unwrap();
        assert_eq!(deleted.load(Ordering::SeqCst), 1);
    }
}
