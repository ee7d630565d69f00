// orderbook-ingestion-rust/src/error.rs
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio_tungstenite::tungstenite;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket connection error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error("WebSocket message processing error: {0}")]
    WebSocketMessage(String),

    #[error("URL parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON serialization/deserialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Decimal parse error: {0}")]
    DecimalParse(#[from] rust_decimal::Error),

    #[error("Address parse error: {0}")]
    AddrParse(#[from] std::net::AddrParseError),

    #[error("Binance API error: {status} - {message} (code: {code})")]
    BinanceApi { status: u16, code: i64, message: String },

    #[error("Binance access is banned until {until}")]
    Banned { until: DateTime<Utc> },

    #[error("Storage error: {0}")]
    Storage(String),

    /// Every storage of the chain rejected the batch.
    #[error("batch was not saved to any storage")]
    NotSaved,

    #[error("only {constructed} of {expected} workers were constructed")]
    InsufficientWorkers { expected: usize, constructed: usize },

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Receiver is closed")]
    ReceiverClosed,

    #[error("Exchange info is not loaded yet")]
    ExchangeInfoMissing,

    #[error("Task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),

    #[error("Invalid configuration value: {0}")]
    InvalidConfig(String),

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl From<tokio::time::error::Elapsed> for IngestionError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        IngestionError::Timeout(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, IngestionError>;
