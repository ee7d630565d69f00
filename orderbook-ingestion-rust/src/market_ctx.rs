use crate::binance_client::{BanState, BinanceClient, BinanceHttpClient};
use crate::clickhouse_storage::ClickHouseStorage;
use crate::config::{AppConfig, MarketConfig};
use crate::data_fixer::DataFixer;
use crate::delta_watcher::{DeltaHoleAuditor, DeltaUpdateIdWatcher};
use crate::exchange_info::{ExchangeInfoCache, ExchangeInfoSvc};
use crate::file_repo::FileRepo;
use crate::hole_reporter::HttpHolesStorage;
use crate::metrics::MetricsRegistry;
use crate::pipeline::{AuxBatchedDataStorage, BatchedDataStorage, StorageChain};
use crate::snapshot_svc::SnapshotSvc;
use crate::types::{BookTickerMessage, Delta, DepthSnapshotPart, ExchangeInfoRecord, MarketType, SymbolTick};
use crate::workers_provider::{
    AllTickersWorkersProvider, BookTicksWorkerProvider, DeltaWorkerProvider, StreamWorkerSettings,
    TradingSymbolsWorkersProvider, WsDataWorkersProvider,
};
use crate::ws_service::WsSvc;
use crate::Result;
use async_trait::async_trait;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::task::TaskTracker;
use tracing::{info, info_span};
use tracing_futures::Instrument;

/// A long-running part of a market that can be started once and shut down once.
#[async_trait]
pub trait BackgroundService: Send + Sync {
    fn name(&self) -> String;

    /// Runs until `shutdown` is called.
    async fn start(&self);

    async fn shutdown(&self);
}

#[async_trait]
impl<M, T> BackgroundService for WsSvc<M, T>
where
    M: Send + 'static,
    T: Serialize + Send + Sync + 'static,
{
    fn name(&self) -> String {
        "ws".into()
    }
    async fn start(&self) {
        WsSvc::start(self).await
    }
    async fn shutdown(&self) {
        WsSvc::shutdown(self).await
    }
}

#[async_trait]
impl<T: Send + Sync + 'static> BackgroundService for DataFixer<T> {
    fn name(&self) -> String {
        "fixer".into()
    }
    async fn start(&self) {
        DataFixer::start(self).await
    }
    async fn shutdown(&self) {
        DataFixer::shutdown(self).await
    }
}

#[async_trait]
impl BackgroundService for SnapshotSvc {
    fn name(&self) -> String {
        "snapshots".into()
    }
    async fn start(&self) {
        SnapshotSvc::start(self).await
    }
    async fn shutdown(&self) {
        SnapshotSvc::shutdown(self).await
    }
}

#[async_trait]
impl BackgroundService for ExchangeInfoSvc {
    fn name(&self) -> String {
        "exchange_info".into()
    }
    async fn start(&self) {
        ExchangeInfoSvc::start(self).await
    }
    async fn shutdown(&self) {
        ExchangeInfoSvc::shutdown(self).await
    }
}

/// Primary storage plus its local fallback for one data kind.
struct TieredStorage<T> {
    primary: Arc<ClickHouseStorage<T>>,
    fallback: Arc<FileRepo<T>>,
    chain: StorageChain<T>,
}

impl<T> TieredStorage<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn new(data_type: &str, primary: ClickHouseStorage<T>, fallback_dir: &Path, attempt_timeout: Duration) -> Self {
        let primary = Arc::new(primary);
        let fallback = Arc::new(FileRepo::new(fallback_dir.join(data_type)));
        let chain = StorageChain::new(
            data_type,
            vec![
                primary.clone() as Arc<dyn BatchedDataStorage<T>>,
                fallback.clone() as Arc<dyn BatchedDataStorage<T>>,
            ],
            attempt_timeout,
        );
        Self { primary, fallback, chain }
    }

    fn fixer(&self, cfg: &AppConfig) -> Arc<dyn BackgroundService> {
        Arc::new(DataFixer::new(
            self.chain.data_type(),
            self.primary.clone(),
            vec![self.fallback.clone() as Arc<dyn AuxBatchedDataStorage<T>>],
            &cfg.fixer,
        ))
    }
}

/// Every service of one Binance market, wired to shared exchange info, ban state and storages.
pub struct BinanceMarketCtx {
    market_type: MarketType,
    exchange_info_svc: Arc<ExchangeInfoSvc>,
    services: Vec<Arc<dyn BackgroundService>>,
    tracker: TaskTracker,
}

impl BinanceMarketCtx {
    pub fn new(cfg: &AppConfig, market: &MarketConfig, registry: &MetricsRegistry) -> Result<Self> {
        let market_type = market.market_type;
        let prefix = market_type.as_str();
        let fallback_dir = cfg.fallback_dir.join(prefix);
        let timeout = Duration::from_secs(cfg.primary_storage.timeout_secs);

        let exchange_info = Arc::new(ExchangeInfoCache::new());
        let ban = BanState::new();
        let client: Arc<dyn BinanceClient> = Arc::new(BinanceHttpClient::new(
            &market.rest_base_url,
            market_type,
            ban.clone(),
            exchange_info.clone(),
        )?);

        let mut services: Vec<Arc<dyn BackgroundService>> = Vec::new();
        let stream_settings = |data_type: String, batch_size: usize| StreamWorkerSettings {
            data_type,
            stream_base_url: market.stream_base_url.clone(),
            ban: ban.clone(),
            recv_timeout: market.recv_timeout(),
            batch_size,
            emergency_dump_dir: Some(cfg.emergency_dump_dir.clone()),
        };

        // exchange info
        let info_storage: TieredStorage<ExchangeInfoRecord> = TieredStorage::new(
            "exchange_info",
            ClickHouseStorage::new(&cfg.primary_storage, market.exchange_info.table.clone())?,
            &fallback_dir,
            timeout,
        );
        let exchange_info_svc = Arc::new(ExchangeInfoSvc::new(
            client.clone(),
            exchange_info.clone(),
            info_storage.chain.clone(),
            Duration::from_secs(market.exchange_info.update_period_mins * 60),
        ));
        services.push(exchange_info_svc.clone());
        services.push(info_storage.fixer(cfg));

        // deltas
        let deltas_type = format!("{prefix}_deltas");
        let deltas_metrics = registry.pipeline(&deltas_type);
        let mut deltas_primary = ClickHouseStorage::<Delta>::new(&cfg.primary_storage, market.deltas.table.clone())?;
        if let Some(keys_table) = &market.deltas.keys_table {
            deltas_primary = deltas_primary.with_processing_keys(keys_table.clone());
        }
        let deltas_storage = TieredStorage::new("deltas", deltas_primary, &fallback_dir, timeout);
        let watcher = Arc::new(DeltaUpdateIdWatcher::new(
            market_type,
            Duration::from_secs(cfg.watcher.prune_after_hours * 3600),
            Duration::from_secs(cfg.watcher.prune_interval_mins * 60),
        ));
        let auditor = Arc::new(DeltaHoleAuditor::new(
            watcher,
            Arc::new(HttpHolesStorage::new(&cfg.hole_reporter_url, cfg.service_name.clone())?),
            deltas_metrics.clone(),
        ));
        let delta_worker_provider = DeltaWorkerProvider::new(
            stream_settings(deltas_type.clone(), market.deltas.batch_size),
            market.deltas.update_speed_ms,
            deltas_storage.chain.clone(),
            auditor,
            deltas_metrics,
        );
        let deltas_provider = TradingSymbolsWorkersProvider::new(
            deltas_type.clone(),
            market.deltas.num_workers,
            Arc::new(delta_worker_provider),
            exchange_info.clone(),
        );
        services.push(Arc::new(WsSvc::new(deltas_type, Arc::new(deltas_provider), market.reconnect_period())));
        services.push(deltas_storage.fixer(cfg));

        // book ticks
        if market.book_ticks.enabled {
            let ticks_type = format!("{prefix}_book_ticks");
            let ticks_metrics = registry.pipeline(&ticks_type);
            let mut ticks_primary =
                ClickHouseStorage::<SymbolTick>::new(&cfg.primary_storage, market.book_ticks.table.clone())?;
            if let Some(keys_table) = &market.book_ticks.keys_table {
                ticks_primary = ticks_primary.with_processing_keys(keys_table.clone());
            }
            let ticks_storage = TieredStorage::new("book_ticks", ticks_primary, &fallback_dir, timeout);
            let ticks_worker_provider = BookTicksWorkerProvider::new(
                stream_settings(ticks_type.clone(), market.book_ticks.batch_size),
                ticks_storage.chain.clone(),
                ticks_metrics,
            );
            let ticks_provider: Arc<dyn WsDataWorkersProvider<BookTickerMessage, SymbolTick>> =
                if market.book_ticks.use_all_tickers_stream {
                    Arc::new(AllTickersWorkersProvider::new(ticks_worker_provider))
                } else {
                    Arc::new(TradingSymbolsWorkersProvider::new(
                        ticks_type.clone(),
                        market.book_ticks.num_workers,
                        Arc::new(ticks_worker_provider),
                        exchange_info.clone(),
                    ))
                };
            services.push(Arc::new(WsSvc::new(ticks_type, ticks_provider, market.reconnect_period())));
            services.push(ticks_storage.fixer(cfg));
        }

        // snapshots
        if market.snapshots.enabled {
            let mut snapshots_primary =
                ClickHouseStorage::<DepthSnapshotPart>::new(&cfg.primary_storage, market.snapshots.table.clone())?;
            if let Some(keys_table) = &market.snapshots.keys_table {
                snapshots_primary = snapshots_primary.with_processing_keys(keys_table.clone());
            }
            let snapshots_storage = TieredStorage::new("snapshots", snapshots_primary, &fallback_dir, timeout);
            services.push(Arc::new(SnapshotSvc::new(
                client,
                exchange_info,
                snapshots_storage.chain.clone(),
                market.snapshots.depth,
            )));
            services.push(snapshots_storage.fixer(cfg));
        }

        Ok(Self {
            market_type,
            exchange_info_svc,
            services,
            tracker: TaskTracker::new(),
        })
    }

    pub fn market_type(&self) -> MarketType {
        self.market_type
    }

    /// Loads the exchange info, then launches every service in the background.
    pub async fn start(&self) -> Result<()> {
        self.exchange_info_svc.load_initial().await?;
        for service in &self.services {
            let span = info_span!("market", market = %self.market_type, service = %service.name());
            let service = service.clone();
            self.tracker.spawn(async move { service.start().await }.instrument(span));
        }
        info!("{} market started {} services", self.market_type, self.services.len());
        Ok(())
    }

    /// Shuts every service down concurrently and waits for all of them.
    pub async fn shutdown(&self) {
        join_all(self.services.iter().map(|service| service.shutdown())).await;
        self.tracker.close();
        self.tracker.wait().await;
        info!("{} market stopped", self.market_type);
    }
}
