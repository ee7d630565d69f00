use crate::delta_watcher::HolesStorage;
use crate::error::IngestionError;
use crate::types::DeltaHole;
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::trace;

const SERVICE_NAME_HEADER: &str = "serviceName";

/// Sends detected holes to the hole tracking service.
pub struct HttpHolesStorage {
    client: Client,
    url: String,
    service_name: String,
}

impl HttpHolesStorage {
    pub fn new(base_url: &str, service_name: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: Client::builder().timeout(Duration::from_secs(5)).build()?,
            url: format!("{}/delta/hole", base_url.trim_end_matches('/')),
            service_name: service_name.into(),
        })
    }
}

#[async_trait]
impl HolesStorage for HttpHolesStorage {
    async fn save_delta_hole(&self, hole: &DeltaHole) -> Result<()> {
        trace!("reporting hole {:?} to {}", hole, self.url);
        let response = self
            .client
            .post(&self.url)
            .header(SERVICE_NAME_HEADER, &self.service_name)
            .json(hole)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(IngestionError::Storage(format!("hole tracker answered {status}: {body}")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, Side};
    use mockito::Matcher;

    fn hole() -> DeltaHole {
        DeltaHole {
            symbol: "btcusdt".into(),
            side: Side::Bid,
            first_update_id: 7,
            last_update_id: 8,
            timestamp_ms: 1_700_000_000_000,
            market_type: MarketType::Usd,
        }
    }

    #[tokio::test]
    async fn posts_hole_as_json() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/delta/hole")
            .match_header("serviceName", "nestor-test")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "symbol": "btcusdt",
                "side": "bid",
                "first_update_id": 7,
                "last_update_id": 8,
                "market_type": "usd"
            })))
            .with_status(200)
            .create_async()
            .await;

        let storage = HttpHolesStorage::new(&server.url(), "nestor-test").unwrap();
        storage.save_delta_hole(&hole()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn server_error_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server.mock("POST", "/delta/hole").with_status(500).create_async().await;

        let storage = HttpHolesStorage::new(&server.url(), "nestor-test").unwrap();
        assert!(matches!(storage.save_delta_hole(&hole()).await, Err(IngestionError::Storage(_))));
    }
}
