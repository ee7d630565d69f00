//! Sequence gap detection for diff. depth deltas.
//!
//! The watcher keeps the highest update id seen per symbol and turns every jump in the
//! sequence into a [`DeltaHole`]. Watermarks live in memory only: after a restart the first
//! batch of each symbol is trusted, and a gap spanning the restart goes unnoticed.

use crate::metrics::PipelineMetrics;
use crate::pipeline::BatchAuditor;
use crate::types::{Delta, DeltaHole, MarketType, Side};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

pub const HOLE_REPORT_ATTEMPTS: usize = 3;
pub const HOLE_REPORT_TIMEOUT: Duration = Duration::from_secs(5);

/// Collaborator recording detected holes.
#[async_trait]
pub trait HolesStorage: Send + Sync {
    async fn save_delta_hole(&self, hole: &DeltaHole) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct Watermark {
    last_update_id: i64,
    touched_at: DateTime<Utc>,
}

#[derive(Debug)]
struct WatcherState {
    watermarks: HashMap<String, Watermark>,
    last_prune: DateTime<Utc>,
}

pub struct DeltaUpdateIdWatcher {
    market_type: MarketType,
    max_age: ChronoDuration,
    prune_interval: ChronoDuration,
    state: Mutex<WatcherState>,
}

impl DeltaUpdateIdWatcher {
    pub fn new(market_type: MarketType, max_age: Duration, prune_interval: Duration) -> Self {
        Self {
            market_type,
            max_age: ChronoDuration::seconds(max_age.as_secs() as i64),
            prune_interval: ChronoDuration::seconds(prune_interval.as_secs() as i64),
            state: Mutex::new(WatcherState {
                watermarks: HashMap::new(),
                last_prune: Utc::now(),
            }),
        }
    }

    /// Returns the holes found in `batch` and advances the watermarks past it.
    ///
    /// The whole batch is processed under one lock so batches of the same symbol coming
    /// from different workers never interleave.
    pub fn get_holes_and_update(&self, batch: &[Delta]) -> Vec<DeltaHole> {
        let now = Utc::now();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if now - state.last_prune >= self.prune_interval {
            Self::prune(state, now - self.max_age);
            state.last_prune = now;
        }

        let mut holes = Vec::new();
        for delta in batch {
            match state.watermarks.get_mut(&delta.symbol) {
                Some(mark) => {
                    if delta.first_update_id - mark.last_update_id > 1 {
                        holes.push(DeltaHole {
                            symbol: delta.symbol.clone(),
                            side: Side::from_is_bid(delta.is_bid),
                            first_update_id: mark.last_update_id + 1,
                            last_update_id: delta.first_update_id - 1,
                            timestamp_ms: delta.timestamp_ms,
                            market_type: self.market_type,
                        });
                    }
                    mark.last_update_id = mark.last_update_id.max(delta.update_id);
                    mark.touched_at = now;
                }
                None => {
                    state.watermarks.insert(
                        delta.symbol.clone(),
                        Watermark { last_update_id: delta.update_id, touched_at: now },
                    );
                }
            }
        }
        holes
    }

    /// Forgets symbols whose watermark was not advanced since `cutoff`. Returns how many were dropped.
    pub fn prune_older_than(&self, cutoff: DateTime<Utc>) -> usize {
        let mut guard = self.state.lock();
        Self::prune(&mut guard, cutoff)
    }

    fn prune(state: &mut WatcherState, cutoff: DateTime<Utc>) -> usize {
        let before = state.watermarks.len();
        state.watermarks.retain(|_, mark| mark.touched_at >= cutoff);
        let dropped = before - state.watermarks.len();
        if dropped > 0 {
            debug!("pruned {} stale watermarks", dropped);
        }
        dropped
    }

    pub fn watermark(&self, symbol: &str) -> Option<i64> {
        self.state.lock().watermarks.get(symbol).map(|mark| mark.last_update_id)
    }

    pub fn tracked_symbols(&self) -> usize {
        self.state.lock().watermarks.len()
    }
}

/// Plugs the watcher into a delta worker and reports what it finds.
pub struct DeltaHoleAuditor {
    watcher: Arc<DeltaUpdateIdWatcher>,
    holes_storage: Arc<dyn HolesStorage>,
    metrics: Arc<PipelineMetrics>,
    attempt_timeout: Duration,
}

impl DeltaHoleAuditor {
    pub fn new(
        watcher: Arc<DeltaUpdateIdWatcher>,
        holes_storage: Arc<dyn HolesStorage>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            watcher,
            holes_storage,
            metrics,
            attempt_timeout: HOLE_REPORT_TIMEOUT,
        }
    }

    async fn report_one(&self, hole: &DeltaHole) -> bool {
        for attempt in 1..=HOLE_REPORT_ATTEMPTS {
            match tokio::time::timeout(self.attempt_timeout, self.holes_storage.save_delta_hole(hole)).await {
                Ok(Ok(())) => return true,
                Ok(Err(e)) => warn!("hole report attempt {}/{} failed: {}", attempt, HOLE_REPORT_ATTEMPTS, e),
                Err(_) => warn!("hole report attempt {}/{} timed out", attempt, HOLE_REPORT_ATTEMPTS),
            }
        }
        false
    }
}

#[async_trait]
impl BatchAuditor<Delta> for DeltaHoleAuditor {
    fn audit(&self, batch: &[Delta]) -> Vec<DeltaHole> {
        let holes = self.watcher.get_holes_and_update(batch);
        if !holes.is_empty() {
            self.metrics.record_holes(holes.len());
        }
        holes
    }

    async fn report(&self, holes: Vec<DeltaHole>) {
        for hole in &holes {
            warn!(
                "delta hole for {} {:?}: {}..={}",
                hole.symbol, hole.side, hole.first_update_id, hole.last_update_id
            );
            if !self.report_one(hole).await {
                self.metrics.record_hole_dropped();
                error!("dropping hole report for {} {}..={}", hole.symbol, hole.first_update_id, hole.last_update_id);
            }
        }
    }
}
