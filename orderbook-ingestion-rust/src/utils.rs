use crate::Result;
use chrono::Utc;
use rust_decimal::Decimal;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const MILLIS_IN_HOUR: i64 = 3_600_000;

// Helper to parse Decimal from string, returning an error on failure
pub fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(Into::into)
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Whole hours since the Unix epoch for a millisecond timestamp.
pub fn hour_number(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(MILLIS_IN_HOUR)
}

/// Sleeps for `period` unless the token fires first. Returns `false` when cancelled.
pub async fn sleep_or_cancel(period: Duration, cancel_token: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(period) => true,
        _ = cancel_token.cancelled() => false,
    }
}

pub mod url_encoding {
    use form_urlencoded::Serializer;

    pub fn form_urlencoded<'a>(params: impl IntoIterator<Item = (&'a str, &'a str)>) -> String {
        let mut serializer = Serializer::new(String::new());
        serializer.extend_pairs(params);
        serializer.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hour_number_floors_towards_epoch() {
        assert_eq!(hour_number(0), 0);
        assert_eq!(hour_number(MILLIS_IN_HOUR - 1), 0);
        assert_eq!(hour_number(MILLIS_IN_HOUR), 1);
        assert_eq!(hour_number(1_700_000_000_000), 472_222);
        assert_eq!(hour_number(-1), -1);
    }

    #[test]
    fn query_string_is_encoded() {
        let query = url_encoding::form_urlencoded([("symbol", "BTCUSDT"), ("limit", "5000")]);
        assert_eq!(query, "symbol=BTCUSDT&limit=5000");
    }

    #[test]
    fn bad_decimal_is_an_error() {
        assert!(parse_decimal("1.25").is_ok());
        assert!(parse_decimal("abc").is_err());
    }

    #[tokio::test]
    async fn cancelled_sleep_returns_early() {
        let token = CancellationToken::new();
        token.cancel();
        assert!(!sleep_or_cancel(Duration::from_secs(3600), &token).await);
    }
}
