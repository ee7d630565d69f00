#![allow(dead_code)]

use async_trait::async_trait;
use orderbook_ingestion::pipeline::{BatchedDataStorage, DataReceiver};
use orderbook_ingestion::{IngestionError, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Counts the live connections serving each symbol and flags any moment a watched symbol has none.
#[derive(Default)]
pub struct CoverageTracker {
    active: Mutex<HashMap<String, usize>>,
    watched: Mutex<HashSet<String>>,
    uncovered: Mutex<Vec<String>>,
    stopping: AtomicBool,
}

impl CoverageTracker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn watch(&self, symbols: &[&str]) {
        self.watched.lock().extend(symbols.iter().map(|s| s.to_string()));
    }

    /// Coverage loss is expected from here on.
    pub fn begin_stop(&self) {
        self.stopping.store(true, Ordering::SeqCst);
    }

    pub fn connected(&self, symbols: &[String]) {
        let mut active = self.active.lock();
        for symbol in symbols {
            *active.entry(symbol.clone()).or_default() += 1;
        }
    }

    pub fn disconnected(&self, symbols: &[String]) {
        let mut active = self.active.lock();
        for symbol in symbols {
            let count = active.entry(symbol.clone()).or_default();
            *count = count.saturating_sub(1);
            if *count == 0 && !self.stopping.load(Ordering::SeqCst) && self.watched.lock().contains(symbol) {
                self.uncovered.lock().push(symbol.clone());
            }
        }
    }

    pub fn active(&self, symbol: &str) -> usize {
        self.active.lock().get(symbol).copied().unwrap_or(0)
    }

    pub fn uncovered(&self) -> Vec<String> {
        self.uncovered.lock().clone()
    }
}

/// Emits a number every few milliseconds for its symbols until shut down.
pub struct CoverageReceiver {
    symbols: Vec<String>,
    tracker: Arc<CoverageTracker>,
    connect_delay: Duration,
    next: AtomicU32,
    connected: AtomicBool,
    closed: CancellationToken,
}

impl CoverageReceiver {
    pub fn new(symbols: Vec<String>, tracker: Arc<CoverageTracker>, connect_delay: Duration) -> Self {
        Self {
            symbols,
            tracker,
            connect_delay,
            next: AtomicU32::new(0),
            connected: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl DataReceiver<u32> for CoverageReceiver {
    async fn connect_ws(&self) -> Result<()> {
        tokio::time::sleep(self.connect_delay).await;
        if !self.connected.swap(true, Ordering::SeqCst) {
            self.tracker.connected(&self.symbols);
        }
        Ok(())
    }

    async fn recv(&self) -> Result<u32> {
        tokio::select! {
            _ = self.closed.cancelled() => Err(IngestionError::ReceiverClosed),
            _ = tokio::time::sleep(Duration::from_millis(2)) => Ok(self.next.fetch_add(1, Ordering::SeqCst)),
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        if self.connected.swap(false, Ordering::SeqCst) {
            self.tracker.disconnected(&self.symbols);
        }
    }
}

/// Primary storage stand-in that can be switched off.
#[derive(Default)]
pub struct SwitchableStorage {
    pub rows: Mutex<Vec<u32>>,
    pub down: AtomicBool,
}

impl SwitchableStorage {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

#[async_trait]
impl BatchedDataStorage<u32> for SwitchableStorage {
    async fn save(&self, batch: &[u32]) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            return Err(IngestionError::Storage("primary unavailable".into()));
        }
        self.rows.lock().extend_from_slice(batch);
        Ok(())
    }
}
