use crate::binance_client::BinanceClient;
use crate::pipeline::StorageChain;
use crate::types::{ExchangeInfo, ExchangeInfoRecord};
use crate::utils::sleep_or_cancel;
use crate::Result;
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

pub const TRADING_STATUS: &str = "TRADING";
const REQUEST_WEIGHT: &str = "REQUEST_WEIGHT";
const INITIAL_LOAD_ATTEMPTS: usize = 3;

/// Latest exchange metadata of one market. Replaced as a whole on refresh.
#[derive(Debug, Default)]
pub struct ExchangeInfoCache {
    value: RwLock<Option<Arc<ExchangeInfo>>>,
}

impl ExchangeInfoCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, info: ExchangeInfo) {
        *self.value.write() = Some(Arc::new(info));
    }

    pub fn get_val(&self) -> Option<Arc<ExchangeInfo>> {
        self.value.read().clone()
    }

    /// Lowercased symbols in `TRADING` status, in exchange order.
    pub fn trading_symbols(&self) -> Vec<String> {
        self.get_val()
            .map(|info| {
                info.symbols
                    .iter()
                    .filter(|s| s.status == TRADING_STATUS)
                    .map(|s| s.symbol.to_lowercase())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn request_weight_limit(&self) -> Option<u32> {
        self.get_val()?
            .rate_limits
            .iter()
            .find(|l| l.rate_limit_type == REQUEST_WEIGHT)
            .map(|l| l.limit)
    }

    /// Window the request weight limit applies to.
    pub fn request_weight_window(&self) -> Option<Duration> {
        let info = self.get_val()?;
        let limit = info.rate_limits.iter().find(|l| l.rate_limit_type == REQUEST_WEIGHT)?;
        let unit_secs = match limit.interval.as_str() {
            "SECOND" => 1,
            "MINUTE" => 60,
            "HOUR" => 3600,
            "DAY" => 86_400,
            _ => return None,
        };
        Some(Duration::from_secs(unit_secs * u64::from(limit.interval_num)))
    }

    /// Suffix of the used-weight response header, e.g. `1m`.
    pub fn limit_header_suffix(&self) -> Option<String> {
        let info = self.get_val()?;
        let limit = info.rate_limits.iter().find(|l| l.rate_limit_type == REQUEST_WEIGHT)?;
        let unit = match limit.interval.as_str() {
            "SECOND" => "s",
            "MINUTE" => "m",
            "HOUR" => "h",
            "DAY" => "d",
            _ => return None,
        };
        Some(format!("{}{}", limit.interval_num, unit))
    }
}

/// Hash of the exchange info content, ignoring the server time which changes on every call.
pub fn content_hash(info: &ExchangeInfo) -> Result<i64> {
    let mut normalized = info.clone();
    normalized.server_time = 0;
    let digest = Sha256::digest(serde_json::to_vec(&normalized)?);
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    Ok(i64::from_be_bytes(head))
}

/// Keeps the exchange info cache fresh and persists every distinct version of it.
pub struct ExchangeInfoSvc {
    client: Arc<dyn BinanceClient>,
    cache: Arc<ExchangeInfoCache>,
    storages: StorageChain<ExchangeInfoRecord>,
    period: Duration,
    last_saved_hash: Mutex<Option<i64>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl ExchangeInfoSvc {
    pub fn new(
        client: Arc<dyn BinanceClient>,
        cache: Arc<ExchangeInfoCache>,
        storages: StorageChain<ExchangeInfoRecord>,
        period: Duration,
    ) -> Self {
        Self {
            client,
            cache,
            storages,
            period,
            last_saved_hash: Mutex::new(None),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    /// Fills the cache before anything depending on it starts.
    pub async fn load_initial(&self) -> Result<()> {
        let mut last_err = None;
        for attempt in 1..=INITIAL_LOAD_ATTEMPTS {
            match self.refresh().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("exchange info load attempt {}/{} failed: {}", attempt, INITIAL_LOAD_ATTEMPTS, e);
                    last_err = Some(e);
                    if !sleep_or_cancel(Duration::from_secs(1), &self.shutdown).await {
                        break;
                    }
                }
            }
        }
        Err(last_err.unwrap_or(crate::error::IngestionError::ExchangeInfoMissing))
    }

    pub async fn refresh(&self) -> Result<()> {
        let info = self.client.get_full_exchange_info().await?;
        let hash = content_hash(&info)?;
        let record = ExchangeInfoRecord {
            server_time: info.server_time,
            hash,
            payload: serde_json::to_string(&info)?,
        };
        self.cache.set(info);

        if *self.last_saved_hash.lock() == Some(hash) {
            return Ok(());
        }
        self.storages.save(std::slice::from_ref(&record)).await?;
        *self.last_saved_hash.lock() = Some(hash);
        info!("exchange info changed, saved version {}", hash);
        Ok(())
    }

    pub async fn start(&self) {
        self.tracker.track_future(self.run()).await
    }

    async fn run(&self) {
        while sleep_or_cancel(self.period, &self.shutdown).await {
            if let Err(e) = self.refresh().await {
                error!("exchange info refresh failed: {}", e);
            }
        }
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
