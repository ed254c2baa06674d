//! Live price feed over the Binance miniTicker WebSocket stream.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::models::MarketExtras;
use crate::state::SharedStateStore;

const PROD_STREAM_URL: &str = "wss://stream.binance.com:9443";
const TESTNET_STREAM_URL: &str = "wss://stream.testnet.binance.vision";

const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);

fn reconnect_policy() -> ExponentialBackoff {
    ExponentialBackoff {
        initial_interval: Duration::from_secs(1),
        max_interval: MAX_RECONNECT_DELAY,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

/// Combined-stream envelope.
#[derive(Deserialize)]
struct StreamEnvelope {
    data: MiniTicker,
}

/// 24h rolling mini-ticker event.
#[derive(Deserialize)]
struct MiniTicker {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", with = "rust_decimal::serde::str")]
    close: Decimal,
    #[serde(rename = "o", with = "rust_decimal::serde::str")]
    open: Decimal,
    #[serde(rename = "v", with = "rust_decimal::serde::str")]
    volume: Decimal,
}

/// Pushes mini-ticker prices into the shared store, reconnecting with
/// exponential backoff until shut down.
pub struct BinanceStreamClient {
    store: Arc<SharedStateStore>,
    symbols: Vec<String>,
    stream_base: String,
}

impl BinanceStreamClient {
    pub fn new(store: Arc<SharedStateStore>, symbols: Vec<String>, testnet: bool) -> Self {
        let stream_base = if testnet { TESTNET_STREAM_URL } else { PROD_STREAM_URL };
        Self {
            store,
            symbols,
            stream_base: stream_base.to_string(),
        }
    }

    fn stream_url(&self) -> String {
        let streams = self
            .symbols
            .iter()
            .map(|s| format!("{}@miniTicker", s.to_lowercase()))
            .collect::<Vec<_>>()
            .join("/");
        format!("{}/stream?streams={streams}", self.stream_base)
    }

    /// Run the feed until `shutdown` is set. The reconnect delay grows
    /// exponentially up to one minute; a clean session resets it.
    pub async fn run(&self, shutdown: Arc<AtomicBool>) {
        let mut policy = reconnect_policy();

        while !shutdown.load(Ordering::SeqCst) {
            match self.run_session(&shutdown).await {
                Ok(()) => {
                    // Clean shutdown or orderly close.
                    policy.reset();
                }
                Err(e) => {
                    error!(error = %e, "price stream failed");
                }
            }
            self.store.set_stream_connected(false).await;

            if shutdown.load(Ordering::SeqCst) {
                break;
            }
            let delay = policy.next_backoff().unwrap_or(MAX_RECONNECT_DELAY);
            warn!(delay_ms = delay.as_millis() as u64, "reconnecting price stream");
            tokio::time::sleep(delay).await;
        }
        info!("price stream stopped");
    }

    async fn run_session(&self, shutdown: &AtomicBool) -> Result<()> {
        let url = self.stream_url();
        let (ws, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect to {url}"))?;
        let (mut sink, mut source) = ws.split();

        self.store.set_stream_connected(true).await;
        info!(symbols = self.symbols.len(), "price stream connected");

        loop {
            if shutdown.load(Ordering::SeqCst) {
                let _ = sink.send(Message::Close(None)).await;
                return Ok(());
            }

            let message = match tokio::time::timeout(Duration::from_secs(30), source.next()).await
            {
                Ok(Some(message)) => message.context("stream read failed")?,
                Ok(None) => return Ok(()),
                // No traffic for 30 s on an active market means the
                // connection went stale; force a reconnect.
                Err(_) => anyhow::bail!("price stream idle timeout"),
            };

            match message {
                Message::Text(text) => self.handle_event(&text).await,
                Message::Ping(payload) => {
                    sink.send(Message::Pong(payload))
                        .await
                        .context("failed to answer ping")?;
                }
                Message::Close(frame) => {
                    debug!(?frame, "stream closed by server");
                    return Ok(());
                }
                _ => {}
            }
        }
    }

    async fn handle_event(&self, text: &str) {
        let envelope: StreamEnvelope = match serde_json::from_str(text) {
            Ok(envelope) => envelope,
            Err(e) => {
                debug!(error = %e, "ignoring unparseable stream event");
                return;
            }
        };
        let ticker = envelope.data;

        let change_24h = if ticker.open.is_zero() {
            None
        } else {
            Some((ticker.close - ticker.open) / ticker.open * Decimal::from(100))
        };
        let extras = MarketExtras {
            volume: Some(ticker.volume),
            change_24h,
            ..MarketExtras::default()
        };
        self.store
            .update_market(&ticker.symbol, ticker.close, extras)
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stream_url_combines_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        let client = BinanceStreamClient::new(
            store,
            vec!["BTCUSDT".to_string(), "BNBUSDT".to_string()],
            false,
        );
        assert_eq!(
            client.stream_url(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@miniTicker/bnbusdt@miniTicker"
        );
    }

    #[tokio::test]
    async fn test_ticker_event_updates_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        let client = BinanceStreamClient::new(store.clone(), vec!["BTCUSDT".to_string()], true);

        let event = r#"{"stream":"btcusdt@miniTicker","data":{"e":"24hrMiniTicker","E":1700000000000,"s":"BTCUSDT","c":"60000.00","o":"59000.00","h":"60500.00","l":"58900.00","v":"1234.5","q":"73000000.0"}}"#;
        client.handle_event(event).await;

        let snapshot = store.get_market("BTCUSDT").await.expect("price stored");
        assert_eq!(snapshot.price, rust_decimal_macros::dec!(60000.00));
        assert!(snapshot.change_24h.is_some());
    }
}
