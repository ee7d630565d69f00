// orderbook-ingestion-rust/src/types.rs
// Domain records persisted by the pipelines, plus the Binance wire messages they are built from.
use crate::utils::hour_number;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    /// USD-M futures
    Usd,
    /// COIN-M futures
    Coin,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Usd => "usd",
            MarketType::Coin => "coin",
        }
    }

    pub fn depth_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "/api/v3/depth",
            MarketType::Usd => "/fapi/v1/depth",
            MarketType::Coin => "/dapi/v1/depth",
        }
    }

    pub fn exchange_info_path(&self) -> &'static str {
        match self {
            MarketType::Spot => "/api/v3/exchangeInfo",
            MarketType::Usd => "/fapi/v1/exchangeInfo",
            MarketType::Coin => "/dapi/v1/exchangeInfo",
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn from_is_bid(is_bid: bool) -> Self {
        if is_bid {
            Side::Bid
        } else {
            Side::Ask
        }
    }
}

/// Bucket used by downstream hourly reprocessing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProcessingKey {
    pub symbol: String,
    pub hour_no: i64,
}

impl ProcessingKey {
    pub fn new(symbol: impl Into<String>, timestamp_ms: i64) -> Self {
        Self {
            symbol: symbol.into(),
            hour_no: hour_number(timestamp_ms),
        }
    }
}

/// Common shape of every record a pipeline persists.
pub trait MarketRecord {
    fn symbol(&self) -> &str;
    fn timestamp_ms(&self) -> i64;

    fn processing_key(&self) -> ProcessingKey {
        ProcessingKey::new(self.symbol(), self.timestamp_ms())
    }
}

// --- Domain Records ---

/// One changed price level of a diff-depth message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    pub timestamp_ms: i64,
    pub price: Decimal,
    pub count: Decimal,
    pub update_id: i64,
    pub first_update_id: i64,
    pub is_bid: bool,
    pub symbol: String,
}

impl MarketRecord for Delta {
    fn symbol(&self) -> &str {
        &self.symbol
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DepthSnapshotPart {
    pub last_update_id: i64,
    pub is_bid: bool,
    pub price: Decimal,
    pub count: Decimal,
    pub symbol: String,
    pub timestamp_ms: i64,
}

impl MarketRecord for DepthSnapshotPart {
    fn symbol(&self) -> &str {
        &self.symbol
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// Best bid/ask update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolTick {
    pub update_id: i64,
    pub symbol: String,
    pub bid_price: Decimal,
    pub bid_quantity: Decimal,
    pub ask_price: Decimal,
    pub ask_quantity: Decimal,
    pub timestamp_ms: i64,
}

impl MarketRecord for SymbolTick {
    fn symbol(&self) -> &str {
        &self.symbol
    }
    fn timestamp_ms(&self) -> i64 {
        self.timestamp_ms
    }
}

/// Inclusive range of update ids that were never observed for a symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaHole {
    pub symbol: String,
    pub side: Side,
    pub first_update_id: i64,
    pub last_update_id: i64,
    pub timestamp_ms: i64,
    pub market_type: MarketType,
}

/// Persisted copy of the exchange metadata, written whenever its content changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeInfoRecord {
    pub server_time: i64,
    pub hash: i64,
    pub payload: String,
}

// --- Binance Wire Messages ---

/// Envelope of the combined stream endpoint.
#[derive(Debug, Deserialize)]
pub struct CombinedStreamEvent<T> {
    pub stream: String,
    pub data: T,
}

/// Diff. depth stream event.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltaMessage {
    #[serde(rename = "e")]
    pub event_type: String,
    #[serde(rename = "E")]
    pub event_time: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "U")]
    pub first_update_id: i64,
    #[serde(rename = "u")]
    pub update_id: i64,
    #[serde(rename = "b")]
    pub bids: Vec<[String; 2]>,
    #[serde(rename = "a")]
    pub asks: Vec<[String; 2]>,
}

/// Individual symbol book ticker event. Spot streams do not send the event time.
#[derive(Debug, Clone, Deserialize)]
pub struct BookTickerMessage {
    #[serde(rename = "u")]
    pub update_id: i64,
    #[serde(rename = "s")]
    pub symbol: String,
    #[serde(rename = "b")]
    pub bid_price: String,
    #[serde(rename = "B")]
    pub bid_quantity: String,
    #[serde(rename = "a")]
    pub ask_price: String,
    #[serde(rename = "A")]
    pub ask_quantity: String,
    #[serde(rename = "E", default)]
    pub event_time: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepthSnapshot {
    pub last_update_id: i64,
    pub bids: Vec<[String; 2]>,
    pub asks: Vec<[String; 2]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeInfo {
    #[serde(default)]
    pub timezone: String,
    pub server_time: i64,
    #[serde(default)]
    pub rate_limits: Vec<RateLimitInfo>,
    pub symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitInfo {
    pub rate_limit_type: String,
    pub interval: String,
    pub interval_num: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub symbol: String,
    // COIN-M exchange info reports the status under another name
    #[serde(alias = "contractStatus", default)]
    pub status: String,
}
