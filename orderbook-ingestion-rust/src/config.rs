use crate::error::IngestionError;
use crate::types::MarketType;
use crate::Result;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct PrimaryStorageConfig {
    pub url: String, // ClickHouse HTTP interface, e.g. http://clickhouse:8123
    pub database: String,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default = "default_storage_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct FixerConfig {
    #[serde(default = "default_fixer_poll_delay_secs")]
    pub poll_delay_secs: u64,
    #[serde(default = "default_fixer_idle_sleep_secs")]
    pub idle_sleep_secs: u64,
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            poll_delay_secs: default_fixer_poll_delay_secs(),
            idle_sleep_secs: default_fixer_idle_sleep_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WatcherConfig {
    #[serde(default = "default_prune_after_hours")]
    pub prune_after_hours: u64,
    #[serde(default = "default_prune_interval_mins")]
    pub prune_interval_mins: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            prune_after_hours: default_prune_after_hours(),
            prune_interval_mins: default_prune_interval_mins(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeltasConfig {
    pub num_workers: usize,
    pub batch_size: usize,
    #[serde(default = "default_update_speed_ms")]
    pub update_speed_ms: u64, // 100 or 1000 for spot diff depth streams
    pub table: String,
    #[serde(default)]
    pub keys_table: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct BookTicksConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub num_workers: usize,
    pub batch_size: usize,
    #[serde(default)]
    pub use_all_tickers_stream: bool,
    pub table: String,
    #[serde(default)]
    pub keys_table: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SnapshotsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_snapshot_depth")]
    pub depth: u32,
    pub table: String,
    #[serde(default)]
    pub keys_table: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeInfoConfig {
    #[serde(default = "default_exchange_info_period_mins")]
    pub update_period_mins: u64,
    pub table: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    pub market_type: MarketType,
    pub rest_base_url: String, // e.g. https://api.binance.com
    pub stream_base_url: String, // e.g. wss://stream.binance.com:9443
    #[serde(default = "default_reconnect_period_mins")]
    pub reconnect_period_mins: u64,
    #[serde(default = "default_recv_timeout_secs")]
    pub recv_timeout_secs: u64,
    pub deltas: DeltasConfig,
    pub book_ticks: BookTicksConfig,
    pub snapshots: SnapshotsConfig,
    pub exchange_info: ExchangeInfoConfig,
}

impl MarketConfig {
    pub fn reconnect_period(&self) -> Duration {
        Duration::from_secs(self.reconnect_period_mins * 60)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_secs(self.recv_timeout_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub health_check_listen_addr: String, // Address for the HTTP health check and metrics server
    #[serde(default = "default_shutdown_deadline_secs")]
    pub shutdown_deadline_secs: u64,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    pub hole_reporter_url: String,
    pub primary_storage: PrimaryStorageConfig,
    pub fallback_dir: PathBuf,
    #[serde(default = "default_emergency_dump_dir")]
    pub emergency_dump_dir: PathBuf,
    #[serde(default)]
    pub fixer: FixerConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    pub markets: Vec<MarketConfig>,
}

impl AppConfig {
    /// Loads configuration from a file (config/settings.yaml unless CONFIG_PATH says otherwise)
    /// and environment variables.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config/settings".to_string());
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&path).required(false))
            .add_source(
                config::Environment::with_prefix("NESTOR")
                    .prefix_separator("_")
                    .separator("__"), // NESTOR_PRIMARY_STORAGE__URL etc.
            )
            .build()?;

        let cfg: AppConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.markets.is_empty() {
            return Err(IngestionError::InvalidConfig("at least one market must be configured".into()));
        }
        for market in &self.markets {
            let name = market.market_type;
            if market.deltas.num_workers == 0 || market.deltas.batch_size == 0 {
                return Err(IngestionError::InvalidConfig(format!(
                    "{name}: deltas num_workers and batch_size must be positive"
                )));
            }
            if market.book_ticks.enabled
                && (market.book_ticks.num_workers == 0 || market.book_ticks.batch_size == 0)
            {
                return Err(IngestionError::InvalidConfig(format!(
                    "{name}: book_ticks num_workers and batch_size must be positive"
                )));
            }
            if market.reconnect_period_mins == 0 || market.exchange_info.update_period_mins == 0 {
                return Err(IngestionError::InvalidConfig(format!("{name}: periods must be positive")));
            }
            if market.snapshots.depth == 0 {
                return Err(IngestionError::InvalidConfig(format!("{name}: snapshot depth must be positive")));
            }
            // Both sides together must be able to reach the full-book threshold.
            let max_levels = 2 * market.snapshots.depth as usize;
            if market.snapshots.enabled && max_levels < crate::snapshot_svc::THIN_SNAPSHOT_LEVELS {
                return Err(IngestionError::InvalidConfig(format!(
                    "{name}: snapshot depth {} can never produce a full book of {} levels",
                    market.snapshots.depth,
                    crate::snapshot_svc::THIN_SNAPSHOT_LEVELS
                )));
            }
        }
        if self.fixer.idle_sleep_secs == 0 {
            return Err(IngestionError::InvalidConfig("fixer idle_sleep_secs must be positive".into()));
        }
        Ok(())
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_deadline_secs)
    }
}

fn default_true() -> bool {
    true
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_shutdown_deadline_secs() -> u64 {
    60
}
fn default_service_name() -> String {
    "nestor".to_string()
}
fn default_emergency_dump_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_storage_timeout_secs() -> u64 {
    30
}
fn default_fixer_poll_delay_secs() -> u64 {
    1
}
fn default_fixer_idle_sleep_secs() -> u64 {
    300
}
fn default_prune_after_hours() -> u64 {
    24
}
fn default_prune_interval_mins() -> u64 {
    60
}
fn default_update_speed_ms() -> u64 {
    100
}
fn default_snapshot_depth() -> u32 {
    5000
}
fn default_exchange_info_period_mins() -> u64 {
    10
}
fn default_reconnect_period_mins() -> u64 {
    60
}
fn default_recv_timeout_secs() -> u64 {
    30
}

// Example of a default settings file structure (config/settings.yaml)
/*
log_level: info
health_check_listen_addr: "0.0.0.0:8080"
hole_reporter_url: "http://dwarf:8080"
primary_storage:
  url: "http://clickhouse:8123"
  database: "binance"
fallback_dir: "/var/lib/nestor/fallback"
markets:
  - market_type: spot
    rest_base_url: "https://api.binance.com"
    stream_base_url: "wss://stream.binance.com:9443"
    deltas: { num_workers: 8, batch_size: 10000, table: "deltas", keys_table: "delta_keys" }
    book_ticks: { num_workers: 4, batch_size: 5000, table: "book_ticks" }
    snapshots: { depth: 5000, table: "snapshots" }
    exchange_info: { update_period_mins: 10, table: "exchange_info" }
*/

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> AppConfig {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap()
    }

    const MINIMAL: &str = r#"
health_check_listen_addr: "127.0.0.1:8080"
hole_reporter_url: "http://localhost:9000"
primary_storage:
  url: "http://localhost:8123"
  database: "binance"
fallback_dir: "/tmp/fallback"
markets:
  - market_type: usd
    rest_base_url: "https://fapi.binance.com"
    stream_base_url: "wss://fstream.binance.com"
    deltas: { num_workers: 2, batch_size: 100, table: "deltas" }
    book_ticks: { num_workers: 1, batch_size: 10, use_all_tickers_stream: true, table: "ticks" }
    snapshots: { table: "snapshots" }
    exchange_info: { table: "exchange_info" }
"#;

    #[test]
    fn defaults_are_applied() {
        let cfg = parse(MINIMAL);
        cfg.validate().unwrap();
        assert_eq!(cfg.shutdown_deadline(), Duration::from_secs(60));
        assert_eq!(cfg.fixer.poll_delay_secs, 1);
        assert_eq!(cfg.fixer.idle_sleep_secs, 300);
        let market = &cfg.markets[0];
        assert_eq!(market.market_type, MarketType::Usd);
        assert_eq!(market.snapshots.depth, 5000);
        assert!(market.book_ticks.use_all_tickers_stream);
        assert_eq!(market.reconnect_period(), Duration::from_secs(3600));
    }

    #[test]
    fn shallow_snapshot_depth_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.markets[0].snapshots.depth = 1000;
        assert!(matches!(cfg.validate(), Err(IngestionError::InvalidConfig(_))));
        cfg.markets[0].snapshots.enabled = false;
        cfg.validate().unwrap();
    }

    #[test]
    fn shipped_settings_are_valid() {
        let cfg = parse(include_str!("../config/settings.yaml"));
        cfg.validate().unwrap();
        assert!(cfg.markets.iter().all(|market| market.snapshots.depth == 5000));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut cfg = parse(MINIMAL);
        cfg.markets[0].deltas.batch_size = 0;
        assert!(matches!(cfg.validate(), Err(IngestionError::InvalidConfig(_))));
    }
}
