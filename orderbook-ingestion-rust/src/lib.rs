//! Binance order book ingestion: stream workers, tiered storage, gap detection and snapshot scheduling.

pub mod binance_client;
pub mod clickhouse_storage;
pub mod config;
pub mod data_fixer;
pub mod delta_watcher;
pub mod error;
pub mod exchange_info;
pub mod file_repo;
pub mod health_check;
pub mod hole_reporter;
pub mod market_ctx;
pub mod metrics;
pub mod pipeline;
pub mod snapshot_svc;
pub mod stream_receiver;
pub mod transformators;
pub mod types;
pub mod utils;
pub mod workers_provider;
pub mod ws_service;
pub mod ws_worker;

pub use error::{IngestionError, Result};
