use crate::binance_client::BanState;
use crate::error::IngestionError;
use crate::pipeline::DataReceiver;
use crate::types::CombinedStreamEvent;
use crate::Result;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(30);
/// All-market book ticker stream.
pub const ALL_BOOK_TICKERS_STREAM: &str = "!bookTicker";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub fn depth_streams(symbols: &[String], update_speed_ms: u64) -> Vec<String> {
    symbols
        .iter()
        .map(|s| format!("{}@depth@{}ms", s.to_lowercase(), update_speed_ms))
        .collect()
}

pub fn book_ticker_streams(symbols: &[String]) -> Vec<String> {
    symbols.iter().map(|s| format!("{}@bookTicker", s.to_lowercase())).collect()
}

/// `{base}/stream?streams=a/b/c`
pub fn combined_stream_url(stream_base_url: &str, streams: &[String]) -> Result<Url> {
    let mut url = Url::parse(&format!("{}/stream", stream_base_url.trim_end_matches('/')))?;
    // Binance expects the raw `/` separators and `!` prefix, so the query is not form-encoded.
    url.set_query(Some(&format!("streams={}", streams.join("/"))));
    Ok(url)
}

/// One combined-stream websocket connection to Binance, decoding the `data` payload of each event into `M`.
///
/// A connection that times out, errors or is closed by the server is dropped and the next `recv`
/// opens a new one.
pub struct BinanceStreamReceiver<M> {
    url: Url,
    stream_count: usize,
    ban: Arc<BanState>,
    recv_timeout: Duration,
    stream: Mutex<Option<WsStream>>,
    closed: CancellationToken,
    _marker: PhantomData<fn() -> M>,
}

impl<M> BinanceStreamReceiver<M> {
    pub fn new(stream_base_url: &str, streams: &[String], ban: Arc<BanState>, recv_timeout: Duration) -> Result<Self> {
        if streams.is_empty() {
            return Err(IngestionError::InvalidConfig("stream receiver needs at least one stream".into()));
        }
        Ok(Self {
            url: combined_stream_url(stream_base_url, streams)?,
            stream_count: streams.len(),
            ban,
            recv_timeout,
            stream: Mutex::new(None),
            closed: CancellationToken::new(),
            _marker: PhantomData,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    async fn open(&self) -> Result<WsStream> {
        self.ban.check()?;
        match connect_async(self.url.as_str()).await {
            Ok((ws, _response)) => {
                debug!("connected to {} streams", self.stream_count);
                Ok(ws)
            }
            Err(tungstenite::Error::Http(response)) => {
                let retry_after = response.headers().get("retry-after").and_then(|v| v.to_str().ok());
                self.ban.arm_from_status(response.status().as_u16(), retry_after);
                Err(IngestionError::WebSocketMessage(format!(
                    "handshake rejected with status {}",
                    response.status()
                )))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl<M> DataReceiver<M> for BinanceStreamReceiver<M>
where
    M: DeserializeOwned + Send + 'static,
{
    async fn connect_ws(&self) -> Result<()> {
        let ws = self.open().await?;
        *self.stream.lock().await = Some(ws);
        info!("subscribed to {} streams", self.stream_count);
        Ok(())
    }

    async fn recv(&self) -> Result<M> {
        loop {
            if self.closed.is_cancelled() {
                return Err(IngestionError::ReceiverClosed);
            }
            let mut guard = self.stream.lock().await;
            if guard.is_none() {
                *guard = Some(self.open().await?);
                info!("reconnected to {} streams", self.stream_count);
            }
            let Some(ws) = guard.as_mut() else {
                continue;
            };

            let next = tokio::select! {
                _ = self.closed.cancelled() => return Err(IngestionError::ReceiverClosed),
                next = tokio::time::timeout(self.recv_timeout, ws.next()) => next,
            };
            match next {
                Err(_) => {
                    *guard = None;
                    return Err(IngestionError::Timeout(format!("no message within {:?}", self.recv_timeout)));
                }
                Ok(None) => {
                    *guard = None;
                    return Err(IngestionError::WebSocketMessage("stream ended".into()));
                }
                Ok(Some(Err(e))) => {
                    *guard = None;
                    return Err(e.into());
                }
                Ok(Some(Ok(Message::Text(text)))) => {
                    let event: CombinedStreamEvent<M> = serde_json::from_str(&text)?;
                    trace!("message from {}", event.stream);
                    return Ok(event.data);
                }
                Ok(Some(Ok(Message::Binary(bytes)))) => {
                    let event: CombinedStreamEvent<M> = serde_json::from_slice(&bytes)?;
                    return Ok(event.data);
                }
                Ok(Some(Ok(Message::Ping(payload)))) => {
                    ws.send(Message::Pong(payload)).await?;
                }
                Ok(Some(Ok(Message::Close(frame)))) => {
                    warn!("stream closed by server: {:?}", frame);
                    *guard = None;
                    return Err(IngestionError::WebSocketMessage("stream closed by server".into()));
                }
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    async fn shutdown(&self) {
        self.closed.cancel();
        if let Some(mut ws) = self.stream.lock().await.take() {
            if let Err(e) = ws.close(None).await {
                debug!("close of {} streams failed: {}", self.stream_count, e);
            }
        }
    }
}
