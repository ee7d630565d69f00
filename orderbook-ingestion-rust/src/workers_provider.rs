use crate::binance_client::BanState;
use crate::error::IngestionError;
use crate::exchange_info::ExchangeInfoCache;
use crate::metrics::PipelineMetrics;
use crate::pipeline::{BatchAuditor, StorageChain};
use crate::stream_receiver::{book_ticker_streams, depth_streams, BinanceStreamReceiver, ALL_BOOK_TICKERS_STREAM};
use crate::transformators::{BookTickerTransformator, DeltaTransformator};
use crate::types::{BookTickerMessage, Delta, DeltaMessage, SymbolTick};
use crate::ws_worker::{WorkerSettings, WsDataProcessWorker};
use crate::Result;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Assigns `symbols[i]` to group `i mod num_workers`. Always returns `num_workers` groups, trailing ones
/// possibly empty.
pub fn partition_symbols(symbols: &[String], num_workers: usize) -> Vec<Vec<String>> {
    let num_workers = num_workers.max(1);
    let mut groups = vec![Vec::with_capacity(symbols.len() / num_workers + 1); num_workers];
    for (i, symbol) in symbols.iter().enumerate() {
        groups[i % num_workers].push(symbol.clone());
    }
    groups
}

/// Builds the worker serving one group of symbols.
pub trait WorkerProvider<M, T>: Send + Sync {
    /// `Ok(None)` when the group is empty.
    fn get_new_worker(&self, worker_id: String, symbols: Vec<String>) -> Result<Option<WsDataProcessWorker<M, T>>>;
}

/// Builds a complete slate of workers for the current symbol universe.
pub trait WsDataWorkersProvider<M, T>: Send + Sync {
    fn get_new_workers(&self) -> Result<Vec<Arc<WsDataProcessWorker<M, T>>>>;
}

/// Splits the trading symbols of the exchange info cache over a fixed number of workers.
pub struct TradingSymbolsWorkersProvider<M, T> {
    data_type: String,
    num_workers: usize,
    worker_provider: Arc<dyn WorkerProvider<M, T>>,
    exchange_info: Arc<ExchangeInfoCache>,
    generation: AtomicU64,
}

impl<M, T> TradingSymbolsWorkersProvider<M, T> {
    pub fn new(
        data_type: impl Into<String>,
        num_workers: usize,
        worker_provider: Arc<dyn WorkerProvider<M, T>>,
        exchange_info: Arc<ExchangeInfoCache>,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            num_workers: num_workers.max(1),
            worker_provider,
            exchange_info,
            generation: AtomicU64::new(0),
        }
    }
}

impl<M, T> WsDataWorkersProvider<M, T> for TradingSymbolsWorkersProvider<M, T>
where
    M: Send + 'static,
    T: Send + Sync + 'static,
{
    fn get_new_workers(&self) -> Result<Vec<Arc<WsDataProcessWorker<M, T>>>> {
        if self.exchange_info.get_val().is_none() {
            return Err(IngestionError::ExchangeInfoMissing);
        }
        let symbols = self.exchange_info.trading_symbols();
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        info!(
            "building {} slate #{} for {} symbols over {} workers",
            self.data_type,
            generation,
            symbols.len(),
            self.num_workers
        );

        let mut workers = Vec::with_capacity(self.num_workers);
        for (i, group) in partition_symbols(&symbols, self.num_workers).into_iter().enumerate() {
            let worker_id = format!("{}-{}-{}", self.data_type, generation, i);
            match self.worker_provider.get_new_worker(worker_id, group) {
                Ok(Some(worker)) => workers.push(Arc::new(worker)),
                Ok(None) => {}
                Err(e) => error!("cannot build {} worker #{}: {}", self.data_type, i, e),
            }
        }

        let expected = self.num_workers.min(symbols.len());
        if workers.len() < expected {
            return Err(IngestionError::InsufficientWorkers {
                expected,
                constructed: workers.len(),
            });
        }
        Ok(workers)
    }
}

/// Connection and batching settings shared by every stream worker of one pipeline.
#[derive(Clone)]
pub struct StreamWorkerSettings {
    pub data_type: String,
    pub stream_base_url: String,
    pub ban: Arc<BanState>,
    pub recv_timeout: Duration,
    pub batch_size: usize,
    pub emergency_dump_dir: Option<PathBuf>,
}

impl StreamWorkerSettings {
    fn worker_settings(&self, worker_id: String) -> WorkerSettings {
        let mut settings = WorkerSettings::new(self.data_type.clone(), worker_id, self.batch_size);
        settings.emergency_dump_dir = self.emergency_dump_dir.clone();
        settings
    }
}

pub struct DeltaWorkerProvider {
    stream: StreamWorkerSettings,
    update_speed_ms: u64,
    storages: StorageChain<Delta>,
    auditor: Arc<dyn BatchAuditor<Delta>>,
    metrics: Arc<PipelineMetrics>,
}

impl DeltaWorkerProvider {
    pub fn new(
        stream: StreamWorkerSettings,
        update_speed_ms: u64,
        storages: StorageChain<Delta>,
        auditor: Arc<dyn BatchAuditor<Delta>>,
        metrics: Arc<PipelineMetrics>,
    ) -> Self {
        Self {
            stream,
            update_speed_ms,
            storages,
            auditor,
            metrics,
        }
    }
}

impl WorkerProvider<DeltaMessage, Delta> for DeltaWorkerProvider {
    fn get_new_worker(
        &self,
        worker_id: String,
        symbols: Vec<String>,
    ) -> Result<Option<WsDataProcessWorker<DeltaMessage, Delta>>> {
        if symbols.is_empty() {
            return Ok(None);
        }
        let receiver = BinanceStreamReceiver::new(
            &self.stream.stream_base_url,
            &depth_streams(&symbols, self.update_speed_ms),
            self.stream.ban.clone(),
            self.stream.recv_timeout,
        )?;
        let worker = WsDataProcessWorker::new(
            self.stream.worker_settings(worker_id),
            Arc::new(receiver),
            Arc::new(DeltaTransformator),
            self.storages.clone(),
            self.metrics.clone(),
        )
        .with_auditor(self.auditor.clone());
        Ok(Some(worker))
    }
}

pub struct BookTicksWorkerProvider {
    stream: StreamWorkerSettings,
    storages: StorageChain<SymbolTick>,
    metrics: Arc<PipelineMetrics>,
}

impl BookTicksWorkerProvider {
    pub fn new(stream: StreamWorkerSettings, storages: StorageChain<SymbolTick>, metrics: Arc<PipelineMetrics>) -> Self {
        Self { stream, storages, metrics }
    }

    fn build(&self, worker_id: String, streams: &[String]) -> Result<WsDataProcessWorker<BookTickerMessage, SymbolTick>> {
        let receiver = BinanceStreamReceiver::new(
            &self.stream.stream_base_url,
            streams,
            self.stream.ban.clone(),
            self.stream.recv_timeout,
        )?;
        Ok(WsDataProcessWorker::new(
            self.stream.worker_settings(worker_id),
            Arc::new(receiver),
            Arc::new(BookTickerTransformator),
            self.storages.clone(),
            self.metrics.clone(),
        ))
    }
}

impl WorkerProvider<BookTickerMessage, SymbolTick> for BookTicksWorkerProvider {
    fn get_new_worker(
        &self,
        worker_id: String,
        symbols: Vec<String>,
    ) -> Result<Option<WsDataProcessWorker<BookTickerMessage, SymbolTick>>> {
        if symbols.is_empty() {
            return Ok(None);
        }
        self.build(worker_id, &book_ticker_streams(&symbols)).map(Some)
    }
}

/// Serves every symbol of the market from the single `!bookTicker` stream.
pub struct AllTickersWorkersProvider {
    ticks: BookTicksWorkerProvider,
    generation: AtomicU64,
}

impl AllTickersWorkersProvider {
    pub fn new(ticks: BookTicksWorkerProvider) -> Self {
        Self {
            ticks,
            generation: AtomicU64::new(0),
        }
    }
}

impl WsDataWorkersProvider<BookTickerMessage, SymbolTick> for AllTickersWorkersProvider {
    fn get_new_workers(&self) -> Result<Vec<Arc<WsDataProcessWorker<BookTickerMessage, SymbolTick>>>> {
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        let worker_id = format!("{}-{}-all", self.ticks.stream.data_type, generation);
        let worker = self.ticks.build(worker_id, &[ALL_BOOK_TICKERS_STREAM.to_string()])?;
        Ok(vec![Arc::new(worker)])
    }
}
