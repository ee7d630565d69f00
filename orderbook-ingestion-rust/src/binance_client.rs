use crate::error::IngestionError;
use crate::exchange_info::ExchangeInfoCache;
use crate::types::{DepthSnapshot, DepthSnapshotPart, ExchangeInfo, MarketType};
use crate::utils::{now_ms, parse_decimal, url_encoding};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use parking_lot::Mutex;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, trace, warn};

const USED_WEIGHT_HEADER: &str = "x-mbx-used-weight";
const DEFAULT_BAN_SECS: i64 = 60;
// Coarse local guard; the exchange's own weight accounting is what the callers pace against.
const REQUESTS_PER_MINUTE: NonZeroU32 = match NonZeroU32::new(600) {
    Some(n) => n,
    None => unreachable!(),
};

/// Time until which the exchange refuses our requests. Shared by the REST client and the
/// stream receivers of one market.
#[derive(Debug, Default)]
pub struct BanState {
    banned_until: Mutex<Option<DateTime<Utc>>>,
}

impl BanState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Arms the ban for `period`, never shortening an existing one.
    pub fn ban_for(&self, period: Duration) {
        let period = ChronoDuration::from_std(period).unwrap_or_else(|_| ChronoDuration::seconds(DEFAULT_BAN_SECS));
        let until = Utc::now() + period;
        let mut banned_until = self.banned_until.lock();
        if banned_until.map_or(true, |current| current < until) {
            *banned_until = Some(until);
        }
        warn!("binance ban armed until {}", until);
    }

    pub fn banned_until(&self) -> Option<DateTime<Utc>> {
        let banned_until = *self.banned_until.lock();
        banned_until.filter(|until| *until > Utc::now())
    }

    pub fn check(&self) -> Result<()> {
        match self.banned_until() {
            Some(until) => Err(IngestionError::Banned { until }),
            None => Ok(()),
        }
    }

    /// Applies the ban carried by a 418/429 response. Returns whether one was armed.
    pub fn arm_from_response(&self, status: StatusCode, headers: &HeaderMap) -> bool {
        let retry_after = headers.get(RETRY_AFTER).and_then(|v| v.to_str().ok());
        self.arm_from_status(status.as_u16(), retry_after)
    }

    /// Same as `arm_from_response` for callers holding the raw status and `Retry-After` value,
    /// like a failed websocket handshake.
    pub fn arm_from_status(&self, status: u16, retry_after: Option<&str>) -> bool {
        if status != StatusCode::TOO_MANY_REQUESTS.as_u16() && status != 418 {
            return false;
        }
        let secs = retry_after
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(DEFAULT_BAN_SECS as u64);
        self.ban_for(Duration::from_secs(secs));
        true
    }
}

/// Binance REST calls the ingestion services rely on.
#[async_trait]
pub trait BinanceClient: Send + Sync {
    /// Full order book of `symbol`, bids first.
    async fn get_full_snapshot(&self, symbol: &str, depth: u32) -> Result<Vec<DepthSnapshotPart>>;

    async fn get_full_exchange_info(&self) -> Result<ExchangeInfo>;

    /// Request weight the exchange reported on the latest response.
    fn last_used_weight(&self) -> Option<u32>;
}

#[derive(Debug, serde::Deserialize)]
struct BinanceErrorBody {
    code: i64,
    msg: String,
}

pub struct BinanceHttpClient {
    rest_client: Client,
    base_url: String,
    market_type: MarketType,
    ban: Arc<BanState>,
    exchange_info: Arc<ExchangeInfoCache>,
    rate_limiter: DefaultDirectRateLimiter,
    used_weight: Mutex<Option<u32>>,
}

impl BinanceHttpClient {
    pub fn new(
        base_url: &str,
        market_type: MarketType,
        ban: Arc<BanState>,
        exchange_info: Arc<ExchangeInfoCache>,
    ) -> Result<Self> {
        Ok(Self {
            rest_client: Client::builder().timeout(Duration::from_secs(30)).build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
            market_type,
            ban,
            exchange_info,
            rate_limiter: RateLimiter::direct(Quota::per_minute(REQUESTS_PER_MINUTE)),
            used_weight: Mutex::new(None),
        })
    }

    pub fn ban_state(&self) -> Arc<BanState> {
        self.ban.clone()
    }

    fn record_used_weight(&self, headers: &HeaderMap) {
        let suffix = self.exchange_info.limit_header_suffix();
        let suffixed = suffix.map(|s| format!("{USED_WEIGHT_HEADER}-{s}"));
        let value = suffixed
            .as_deref()
            .and_then(|name| headers.get(name))
            .or_else(|| {
                headers
                    .iter()
                    .find(|(name, _)| name.as_str().starts_with(USED_WEIGHT_HEADER))
                    .map(|(_, value)| value)
            })
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u32>().ok());
        if value.is_some() {
            *self.used_weight.lock() = value;
        }
    }

    async fn send_public_request<T: DeserializeOwned>(&self, path: &str, query_params: &[(&str, &str)]) -> Result<T> {
        self.ban.check()?;
        self.rate_limiter.until_ready().await;

        let url = if query_params.is_empty() {
            format!("{}{}", self.base_url, path)
        } else {
            let query = url_encoding::form_urlencoded(query_params.iter().copied());
            format!("{}{}?{}", self.base_url, path, query)
        };
        trace!("Sending Binance public API request: GET {}", url);

        let response = self.rest_client.get(&url).send().await?;
        let status = response.status();
        self.record_used_weight(response.headers());
        let banned = self.ban.arm_from_response(status, response.headers());
        let text = response.text().await?;

        if status.is_success() {
            return serde_json::from_str(&text).map_err(Into::into);
        }
        let (code, message) = match serde_json::from_str::<BinanceErrorBody>(&text) {
            Ok(body) => (body.code, body.msg),
            Err(_) => (-1, text),
        };
        if banned {
            error!("Binance rejected {} with {} and banned us: {}", path, status, message);
        } else {
            error!("Binance Public API request failed: Status={}, Code={}, Msg={}", status, code, message);
        }
        Err(IngestionError::BinanceApi { status: status.as_u16(), code, message })
    }
}

fn snapshot_parts(snapshot: DepthSnapshot, symbol: &str, timestamp_ms: i64) -> Result<Vec<DepthSnapshotPart>> {
    let levels = snapshot
        .bids
        .iter()
        .map(|level| (level, true))
        .chain(snapshot.asks.iter().map(|level| (level, false)));
    let mut parts = Vec::with_capacity(snapshot.bids.len() + snapshot.asks.len());
    for ([price, count], is_bid) in levels {
        parts.push(DepthSnapshotPart {
            last_update_id: snapshot.last_update_id,
            is_bid,
            price: parse_decimal(price)?,
            count: parse_decimal(count)?,
            symbol: symbol.to_string(),
            timestamp_ms,
        });
    }
    Ok(parts)
}

#[async_trait]
impl BinanceClient for BinanceHttpClient {
    async fn get_full_snapshot(&self, symbol: &str, depth: u32) -> Result<Vec<DepthSnapshotPart>> {
        let upper = symbol.to_uppercase();
        let limit = depth.to_string();
        let snapshot: DepthSnapshot = self
            .send_public_request(self.market_type.depth_path(), &[("symbol", upper.as_str()), ("limit", limit.as_str())])
            .await?;
        snapshot_parts(snapshot, &symbol.to_lowercase(), now_ms())
    }

    async fn get_full_exchange_info(&self) -> Result<ExchangeInfo> {
        self.send_public_request(self.market_type.exchange_info_path(), &[]).await
    }

    fn last_used_weight(&self) -> Option<u32> {
        *self.used_weight.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RateLimitInfo;
    use mockito::Matcher;
    use rust_decimal_macros::dec;

    fn cache_with_minute_limit() -> Arc<ExchangeInfoCache> {
        let cache = Arc::new(ExchangeInfoCache::new());
        cache.set(ExchangeInfo {
            timezone: "UTC".into(),
            server_time: 1,
            rate_limits: vec![RateLimitInfo {
                rate_limit_type: "REQUEST_WEIGHT".into(),
                interval: "MINUTE".into(),
                interval_num: 1,
                limit: 6000,
            }],
            symbols: vec![],
        });
        cache
    }

    #[tokio::test]
    async fn snapshot_is_split_into_parts_and_weight_recorded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v3/depth")
            .match_query(Matcher::AllOf(vec![
                Matcher::UrlEncoded("symbol".into(), "BTCUSDT".into()),
                Matcher::UrlEncoded("limit".into(), "5000".into()),
            ]))
            .with_status(200)
            .with_header("x-mbx-used-weight-1m", "250")
            .with_body(r#"{"lastUpdateId":1027024,"bids":[["4.00000000","431.00000000"]],"asks":[["4.00000200","12.00000000"],["4.1","1"]]}"#)
            .create_async()
            .await;

        let client =
            BinanceHttpClient::new(&server.url(), MarketType::Spot, BanState::new(), cache_with_minute_limit()).unwrap();
        let parts = client.get_full_snapshot("btcusdt", 5000).await.unwrap();
        mock.assert_async().await;

        assert_eq!(parts.len(), 3);
        assert!(parts[0].is_bid);
        assert!(!parts[1].is_bid && !parts[2].is_bid);
        assert_eq!(parts[0].count, dec!(431));
        assert!(parts.iter().all(|p| p.last_update_id == 1027024 && p.symbol == "btcusdt"));
        assert_eq!(client.last_used_weight(), Some(250));
    }

    #[tokio::test]
    async fn too_many_requests_arms_the_ban() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fapi/v1/depth")
            .match_query(Matcher::Any)
            .with_status(429)
            .with_header("retry-after", "120")
            .with_body(r#"{"code":-1003,"msg":"Too many requests."}"#)
            .expect(1)
            .create_async()
            .await;

        let ban = BanState::new();
        let client =
            BinanceHttpClient::new(&server.url(), MarketType::Usd, ban.clone(), Arc::new(ExchangeInfoCache::new()))
                .unwrap();
        let err = client.get_full_snapshot("ethusdt", 100).await.unwrap_err();
        assert!(matches!(err, IngestionError::BinanceApi { status: 429, code: -1003, .. }));
        let until = ban.banned_until().unwrap();
        assert!(until > Utc::now() + ChronoDuration::seconds(100));

        // Banned clients do not hit the exchange at all.
        assert!(matches!(
            client.get_full_snapshot("ethusdt", 100).await,
            Err(IngestionError::Banned { .. })
        ));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn exchange_info_is_fetched_from_market_path() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/dapi/v1/exchangeInfo")
            .with_status(200)
            .with_body(r#"{"timezone":"UTC","serverTime":1700000000000,"rateLimits":[],"symbols":[{"symbol":"BTCUSD_PERP","contractStatus":"TRADING","extra":1}]}"#)
            .create_async()
            .await;

        let client =
            BinanceHttpClient::new(&server.url(), MarketType::Coin, BanState::new(), Arc::new(ExchangeInfoCache::new()))
                .unwrap();
        let info = client.get_full_exchange_info().await.unwrap();
        assert_eq!(info.server_time, 1700000000000);
        assert_eq!(info.symbols[0].status, "TRADING");
    }

    #[test]
    fn expired_ban_reads_clear() {
        let ban = BanState::default();
        assert!(ban.check().is_ok());
        ban.ban_for(Duration::from_secs(0));
        assert!(ban.banned_until().is_none());
        ban.ban_for(Duration::from_secs(30));
        assert!(ban.check().is_err());
    }
}
