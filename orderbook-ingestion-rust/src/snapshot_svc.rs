use crate::binance_client::BinanceClient;
use crate::exchange_info::ExchangeInfoCache;
use crate::pipeline::StorageChain;
use crate::types::DepthSnapshotPart;
use crate::utils::sleep_or_cancel;
use crate::Result;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

pub const DEFAULT_SNAPSHOT_DEPTH: u32 = 5000;
/// Snapshots with fewer levels belong to quiet symbols and are refreshed rarely.
pub const THIN_SNAPSHOT_LEVELS: usize = 10_000;
const IDLE_SLEEP: Duration = Duration::from_secs(10 * 60);
const FALLBACK_WEIGHT_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotOutcome {
    Failed,
    Thin(usize),
    Full(usize),
}

impl SnapshotOutcome {
    fn from_levels(levels: usize) -> Self {
        if levels < THIN_SNAPSHOT_LEVELS {
            SnapshotOutcome::Thin(levels)
        } else {
            SnapshotOutcome::Full(levels)
        }
    }

    /// Delay until the symbol is eligible again.
    pub fn next_refresh_in(&self) -> ChronoDuration {
        match self {
            SnapshotOutcome::Failed => ChronoDuration::minutes(10),
            SnapshotOutcome::Thin(_) => ChronoDuration::days(5),
            SnapshotOutcome::Full(_) => ChronoDuration::hours(24),
        }
    }
}

/// Periodically stores full order book snapshots of every trading symbol.
pub struct SnapshotSvc {
    client: Arc<dyn BinanceClient>,
    exchange_info: Arc<ExchangeInfoCache>,
    storages: StorageChain<DepthSnapshotPart>,
    depth: u32,
    next_refresh: Mutex<HashMap<String, DateTime<Utc>>>,
    idle_sleep: Duration,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl SnapshotSvc {
    pub fn new(
        client: Arc<dyn BinanceClient>,
        exchange_info: Arc<ExchangeInfoCache>,
        storages: StorageChain<DepthSnapshotPart>,
        depth: u32,
    ) -> Self {
        Self {
            client,
            exchange_info,
            storages,
            depth,
            next_refresh: Mutex::new(HashMap::new()),
            idle_sleep: IDLE_SLEEP,
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
        }
    }

    pub fn with_idle_sleep(mut self, idle_sleep: Duration) -> Self {
        self.idle_sleep = idle_sleep;
        self
    }

    pub fn next_refresh(&self, symbol: &str) -> Option<DateTime<Utc>> {
        self.next_refresh.lock().get(symbol).copied()
    }

    /// Trading symbols never fetched or whose refresh time has passed.
    pub fn due_symbols(&self, now: DateTime<Utc>) -> Vec<String> {
        let schedule = self.next_refresh.lock();
        self.exchange_info
            .trading_symbols()
            .into_iter()
            .filter(|symbol| schedule.get(symbol).map_or(true, |at| *at <= now))
            .collect()
    }

    pub async fn start(&self) {
        self.tracker.track_future(self.run()).await
    }

    async fn run(&self) {
        info!("snapshot scheduler started with depth {}", self.depth);
        while !self.shutdown.is_cancelled() {
            let processed = self.run_cycle().await;
            if processed == 0 && !sleep_or_cancel(self.idle_sleep, &self.shutdown).await {
                break;
            }
        }
        info!("snapshot scheduler stopped");
    }

    /// Fetches every due symbol once. Returns how many were processed.
    pub async fn run_cycle(&self) -> usize {
        let queue = self.due_symbols(Utc::now());
        if !queue.is_empty() {
            debug!("{} symbols due for a snapshot", queue.len());
        }
        let mut processed = 0;
        for symbol in queue {
            if self.shutdown.is_cancelled() {
                break;
            }
            let outcome = self.process_symbol(&symbol).await;
            self.reschedule(&symbol, outcome, Utc::now());
            processed += 1;
            if !self.pace().await {
                break;
            }
        }
        processed
    }

    pub async fn process_symbol(&self, symbol: &str) -> SnapshotOutcome {
        match self.fetch_and_save(symbol).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("snapshot of {} failed: {}", symbol, e);
                SnapshotOutcome::Failed
            }
        }
    }

    async fn fetch_and_save(&self, symbol: &str) -> Result<SnapshotOutcome> {
        let parts = self.client.get_full_snapshot(symbol, self.depth).await?;
        if parts.is_empty() {
            warn!("empty snapshot for {}", symbol);
            return Ok(SnapshotOutcome::Thin(0));
        }
        self.storages.save(&parts).await?;
        debug!("saved snapshot of {} with {} levels", symbol, parts.len());
        Ok(SnapshotOutcome::from_levels(parts.len()))
    }

    fn reschedule(&self, symbol: &str, outcome: SnapshotOutcome, now: DateTime<Utc>) {
        self.next_refresh
            .lock()
            .insert(symbol.to_string(), now + outcome.next_refresh_in());
    }

    /// Waits out the exchange's weight window once more than 80% of it is used.
    /// Returns `false` when interrupted by shutdown.
    async fn pace(&self) -> bool {
        let (Some(used), Some(limit)) = (self.client.last_used_weight(), self.exchange_info.request_weight_limit())
        else {
            return true;
        };
        if u64::from(used) * 10 <= u64::from(limit) * 8 {
            return true;
        }
        let window = self.exchange_info.request_weight_window().unwrap_or(FALLBACK_WEIGHT_WINDOW);
        warn!("request weight {}/{} used, pausing snapshots for {:?}", used, limit, window);
        sleep_or_cancel(window, &self.shutdown).await
    }

    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}
