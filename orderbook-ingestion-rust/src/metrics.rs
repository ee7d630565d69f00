//! Per-pipeline counters exposed on the `/metrics` endpoint.

use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Counters for one data type of one market.
#[derive(Debug, Default)]
pub struct PipelineMetrics {
    pub received_records: AtomicU64,
    pub recv_errors: AtomicU64,
    pub saved_primary: AtomicU64,
    pub saved_fallback: AtomicU64,
    pub not_saved: AtomicU64,
    pub save_tasks_started: AtomicU64,
    pub save_tasks_ended: AtomicU64,
    pub holes_detected: AtomicU64,
    pub holes_dropped: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PipelineMetricsSnapshot {
    pub received_records: u64,
    pub recv_errors: u64,
    pub saved_primary: u64,
    pub saved_fallback: u64,
    pub not_saved: u64,
    pub save_tasks_started: u64,
    pub save_tasks_ended: u64,
    pub holes_detected: u64,
    pub holes_dropped: u64,
}

impl PipelineMetrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record_received(&self, records: usize) {
        self.received_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_recv_error(&self) {
        self.recv_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a batch accepted by the storage at `tier` of the chain.
    pub fn record_saved(&self, tier: usize) {
        if tier == 0 {
            self.saved_primary.fetch_add(1, Ordering::Relaxed);
        } else {
            self.saved_fallback.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_not_saved(&self) {
        self.not_saved.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save_started(&self) {
        self.save_tasks_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_save_ended(&self) {
        self.save_tasks_ended.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_holes(&self, detected: usize) {
        self.holes_detected.fetch_add(detected as u64, Ordering::Relaxed);
    }

    pub fn record_hole_dropped(&self) {
        self.holes_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PipelineMetricsSnapshot {
        PipelineMetricsSnapshot {
            received_records: self.received_records.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
            saved_primary: self.saved_primary.load(Ordering::Relaxed),
            saved_fallback: self.saved_fallback.load(Ordering::Relaxed),
            not_saved: self.not_saved.load(Ordering::Relaxed),
            save_tasks_started: self.save_tasks_started.load(Ordering::Relaxed),
            save_tasks_ended: self.save_tasks_ended.load(Ordering::Relaxed),
            holes_detected: self.holes_detected.load(Ordering::Relaxed),
            holes_dropped: self.holes_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Named collection of pipeline metrics, shared with the HTTP server.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    pipelines: RwLock<BTreeMap<String, Arc<PipelineMetrics>>>,
}

impl MetricsRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the metrics registered under `name`, creating them on first use.
    pub fn pipeline(&self, name: &str) -> Arc<PipelineMetrics> {
        if let Some(existing) = self.pipelines.read().get(name) {
            return existing.clone();
        }
        self.pipelines
            .write()
            .entry(name.to_string())
            .or_insert_with(PipelineMetrics::new)
            .clone()
    }

    pub fn snapshot(&self) -> BTreeMap<String, PipelineMetricsSnapshot> {
        self.pipelines
            .read()
            .iter()
            .map(|(name, metrics)| (name.clone(), metrics.snapshot()))
            .collect()
    }
}
