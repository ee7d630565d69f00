use crate::error::IngestionError;
use crate::pipeline::{AuxBatchedDataStorage, BatchedDataStorage, PendingBatch};
use crate::utils::now_ms;
use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, warn};

const TMP_SUFFIX: &str = ".tmp";
const CORRUPT_SUFFIX: &str = ".corrupt";
/// A temporary file untouched this long belongs to a write that was cancelled or crashed.
pub const DEFAULT_STALE_TMP_AGE: Duration = Duration::from_secs(10 * 60);

/// Local fallback storage keeping one JSON file per batch.
///
/// Files are written under a temporary name and renamed once complete, so a reader only
/// ever sees whole batches. Names start with the write time, which makes name order the
/// order batches were stored in.
pub struct FileRepo<T> {
    dir: PathBuf,
    stale_tmp_age: Duration,
    _marker: PhantomData<fn() -> T>,
}

impl<T> FileRepo<T> {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            stale_tmp_age: DEFAULT_STALE_TMP_AGE,
            _marker: PhantomData,
        }
    }

    pub fn with_stale_tmp_age(mut self, age: Duration) -> Self {
        self.stale_tmp_age = age;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Oldest completed batch file, if any. Leftover temporary files of abandoned writes are removed on the way.
    async fn oldest_file(&self) -> Result<Option<PathBuf>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let mut oldest: Option<PathBuf> = None;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.ends_with(TMP_SUFFIX) {
                self.remove_if_stale(&path).await;
                continue;
            }
            if name.ends_with(CORRUPT_SUFFIX) {
                continue;
            }
            if oldest.as_ref().map_or(true, |current| path < *current) {
                oldest = Some(path);
            }
        }
        Ok(oldest)
    }

    async fn remove_if_stale(&self, path: &Path) {
        let modified = match tokio::fs::metadata(path).await.and_then(|meta| meta.modified()) {
            Ok(modified) => modified,
            Err(e) => {
                debug!("cannot stat {}: {}", path.display(), e);
                return;
            }
        };
        let age = SystemTime::now().duration_since(modified).unwrap_or_default();
        if age < self.stale_tmp_age {
            return;
        }
        match tokio::fs::remove_file(path).await {
            Ok(()) => warn!("removed abandoned partial write {}", path.display()),
            Err(e) => error!("cannot remove abandoned partial write {}: {}", path.display(), e),
        }
    }
}

#[async_trait]
impl<T> BatchedDataStorage<T> for FileRepo<T>
where
    T: Serialize + Send + Sync,
{
    async fn save(&self, batch: &[T]) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let name = format!("{}_{}.json", now_ms(), uuid::Uuid::new_v4());
        let path = self.dir.join(&name);
        let tmp_path = self.dir.join(format!("{name}{TMP_SUFFIX}"));

        let bytes = serde_json::to_vec(batch)?;
        tokio::fs::write(&tmp_path, bytes).await?;
        tokio::fs::rename(&tmp_path, &path).await?;
        debug!("stored {} rows in {}", batch.len(), path.display());
        Ok(())
    }
}

#[async_trait]
impl<T> AuxBatchedDataStorage<T> for FileRepo<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    async fn get_with_delete_callback(&self) -> Result<Option<PendingBatch<T>>> {
        let Some(path) = self.oldest_file().await? else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path).await?;
        let data: Vec<T> = match serde_json::from_slice(&bytes) {
            Ok(data) => data,
            Err(e) => {
                // Keep the file for inspection but stop handing it out.
                let mut quarantined = path.clone().into_os_string();
                quarantined.push(CORRUPT_SUFFIX);
                if let Err(rename_err) = tokio::fs::rename(&path, &quarantined).await {
                    error!("cannot quarantine {}: {}", path.display(), rename_err);
                }
                return Err(IngestionError::Storage(format!("unreadable batch file {}: {}", path.display(), e)));
            }
        };

        let on_delete = Box::new(move || {
            async move {
                tokio::fs::remove_file(&path).await?;
                Ok::<(), IngestionError>(())
            }
            .boxed()
        });
        Ok(Some(PendingBatch::new(data, on_delete)))
    }
}
