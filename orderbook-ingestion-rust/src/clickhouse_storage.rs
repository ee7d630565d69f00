use crate::config::PrimaryStorageConfig;
use crate::error::IngestionError;
use crate::pipeline::BatchedDataStorage;
use crate::types::{MarketRecord, ProcessingKey};
use crate::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::time::Duration;
use tracing::{trace, warn};

type KeyFn<T> = fn(&T) -> ProcessingKey;

/// Primary analytical storage, written through the ClickHouse HTTP interface.
pub struct ClickHouseStorage<T> {
    client: Client,
    url: String,
    database: String,
    table: String,
    user: Option<String>,
    password: Option<String>,
    keys: Option<(String, KeyFn<T>)>,
    _marker: PhantomData<fn(&T)>,
}

impl<T> ClickHouseStorage<T> {
    pub fn new(cfg: &PrimaryStorageConfig, table: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            url: cfg.url.trim_end_matches('/').to_string(),
            database: cfg.database.clone(),
            table: table.into(),
            user: cfg.user.clone(),
            password: cfg.password.clone(),
            keys: None,
            _marker: PhantomData,
        })
    }

    async fn insert_rows<R: Serialize>(&self, table: &str, rows: impl Iterator<Item = R>) -> Result<()> {
        let mut body = Vec::new();
        for row in rows {
            serde_json::to_writer(&mut body, &row)?;
            body.push(b'\n');
        }
        let query = format!("INSERT INTO {}.{} FORMAT JSONEachRow", self.database, table);
        trace!("{} ({} bytes)", query, body.len());

        let mut request = self.client.post(&self.url).query(&[("query", query.as_str())]).body(body);
        if let Some(user) = &self.user {
            request = request.basic_auth(user, self.password.as_ref());
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(IngestionError::Storage(format!(
                "clickhouse insert into {}.{} failed with {}: {}",
                self.database,
                table,
                status,
                text.trim()
            )));
        }
        Ok(())
    }
}

impl<T: MarketRecord> ClickHouseStorage<T> {
    /// Also records which (symbol, hour) buckets each batch touched.
    pub fn with_processing_keys(mut self, keys_table: impl Into<String>) -> Self {
        let key_fn: KeyFn<T> = |record| record.processing_key();
        self.keys = Some((keys_table.into(), key_fn));
        self
    }
}

#[async_trait]
impl<T> BatchedDataStorage<T> for ClickHouseStorage<T>
where
    T: Serialize + Send + Sync,
{
    async fn save(&self, batch: &[T]) -> Result<()> {
        if batch.is_empty() {
            warn!("empty batch for {}, nothing to insert", self.table);
            return Ok(());
        }
        self.insert_rows(&self.table, batch.iter()).await?;

        if let Some((keys_table, key_fn)) = &self.keys {
            let keys: BTreeSet<ProcessingKey> = batch.iter().map(key_fn).collect();
            self.insert_rows(keys_table, keys.into_iter()).await?;
        }
        Ok(())
    }
}
