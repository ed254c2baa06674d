//! Signed Binance spot REST client.

use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use sha2::Sha256;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{ExchangeRestClient, Fill, Kline, MarketOrderResult, OrderSide, OrderStatus};

const PROD_BASE_URL: &str = "https://api.binance.com";
const TESTNET_BASE_URL: &str = "https://testnet.binance.vision";

/// Minimum spacing between consecutive requests.
const REQUEST_GAP: Duration = Duration::from_millis(100);

/// Smallest order quantity the client will submit.
const MIN_QUANTITY: Decimal = dec!(0.00001);

type HmacSha256 = Hmac<Sha256>;

pub struct BinanceRestClient {
    http: Client,
    base_url: String,
    api_key: String,
    api_secret: String,
    last_request: Mutex<Instant>,
}

#[derive(Deserialize)]
struct TickerPrice {
    #[serde(with = "rust_decimal::serde::str")]
    price: Decimal,
}

#[derive(Deserialize)]
struct AccountInfo {
    balances: Vec<RawBalance>,
}

#[derive(Deserialize)]
struct RawBalance {
    asset: String,
    #[serde(with = "rust_decimal::serde::str")]
    free: Decimal,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: u64,
    symbol: String,
    #[serde(with = "rust_decimal::serde::str")]
    executed_qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    cummulative_quote_qty: Decimal,
    #[serde(default)]
    fills: Vec<Fill>,
}

#[derive(Deserialize)]
struct OrderQueryResponse {
    status: OrderStatus,
}

#[derive(Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

impl BinanceRestClient {
    pub fn new(api_key: String, api_secret: String, testnet: bool) -> Result<Self> {
        let base_url = if testnet { TESTNET_BASE_URL } else { PROD_BASE_URL };
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: base_url.to_string(),
            api_key,
            api_secret,
            last_request: Mutex::new(Instant::now() - REQUEST_GAP),
        })
    }

    /// Build a client from `BINANCE_API_KEY` / `BINANCE_API_SECRET`.
    pub fn from_env(testnet: bool) -> Result<Self> {
        let api_key =
            std::env::var("BINANCE_API_KEY").context("BINANCE_API_KEY is not set")?;
        let api_secret =
            std::env::var("BINANCE_API_SECRET").context("BINANCE_API_SECRET is not set")?;
        Self::new(api_key, api_secret, testnet)
    }

    /// Round a quantity to the symbol's lot precision. Returns `None` when
    /// the rounded quantity falls below the exchange minimum.
    pub fn round_quantity(symbol: &str, quantity: Decimal) -> Option<Decimal> {
        let dp = if symbol.starts_with("BTC") {
            5
        } else if symbol.starts_with("ETH") {
            4
        } else {
            6
        };
        let rounded = quantity.round_dp_with_strategy(
            dp,
            rust_decimal::RoundingStrategy::ToZero,
        );
        (rounded >= MIN_QUANTITY).then_some(rounded)
    }

    fn sign(&self, query: &str) -> String {
        // Key length is unconstrained for HMAC, new_from_slice cannot fail.
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    async fn throttle(&self) {
        let mut last = self.last_request.lock().await;
        let elapsed = last.elapsed();
        if elapsed < REQUEST_GAP {
            tokio::time::sleep(REQUEST_GAP - elapsed).await;
        }
        *last = Instant::now();
    }

    fn timestamp_ms() -> Result<u128> {
        Ok(SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("system clock before unix epoch")?
            .as_millis())
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &str,
        signed: bool,
    ) -> Result<String> {
        self.throttle().await;

        let query = if signed {
            let mut q = query.to_string();
            if !q.is_empty() {
                q.push('&');
            }
            q.push_str(&format!("timestamp={}&recvWindow=5000", Self::timestamp_ms()?));
            let signature = self.sign(&q);
            format!("{q}&signature={signature}")
        } else {
            query.to_string()
        };

        let url = if query.is_empty() {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}{path}?{query}", self.base_url)
        };

        let mut req = self.http.request(method, &url);
        if signed {
            req = req.header("X-MBX-APIKEY", &self.api_key);
        }

        let response = req.send().await.context("exchange request failed")?;
        let status = response.status();
        let body = response.text().await.context("failed to read response body")?;

        if status.is_success() {
            return Ok(body);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            warn!(%path, "rate limited by exchange");
        }
        match serde_json::from_str::<ApiError>(&body) {
            Ok(err) => Err(anyhow!("exchange error {} ({}): {}", status, err.code, err.msg)),
            Err(_) => Err(anyhow!("exchange error {}: {}", status, body)),
        }
    }
}

#[async_trait]
impl ExchangeRestClient for BinanceRestClient {
    async fn test_connection(&self) -> Result<()> {
        self.request(Method::GET, "/api/v3/ping", "", false).await?;
        // Signed call verifies the credentials as well.
        self.request(Method::GET, "/api/v3/account", "", true).await?;
        debug!("exchange connectivity check passed");
        Ok(())
    }

    async fn get_price(&self, symbol: &str) -> Result<Decimal> {
        let body = self
            .request(
                Method::GET,
                "/api/v3/ticker/price",
                &format!("symbol={symbol}"),
                false,
            )
            .await?;
        let ticker: TickerPrice =
            serde_json::from_str(&body).context("malformed ticker response")?;
        Ok(ticker.price)
    }

    async fn get_balance(&self, asset: &str) -> Result<Decimal> {
        let body = self.request(Method::GET, "/api/v3/account", "", true).await?;
        let account: AccountInfo =
            serde_json::from_str(&body).context("malformed account response")?;
        Ok(account
            .balances
            .into_iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO))
    }

    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> Result<MarketOrderResult> {
        let quantity = Self::round_quantity(symbol, quantity)
            .ok_or_else(|| anyhow!("quantity {quantity} below exchange minimum for {symbol}"))?;

        let client_order_id = uuid::Uuid::new_v4().simple();
        let query = format!(
            "symbol={symbol}&side={side}&type=MARKET&quantity={quantity}\
             &newClientOrderId={client_order_id}"
        );
        let body = self.request(Method::POST, "/api/v3/order", &query, true).await?;
        let order: OrderResponse =
            serde_json::from_str(&body).context("malformed order response")?;

        if order.executed_qty.is_zero() {
            return Err(anyhow!("market order {} executed zero quantity", order.order_id));
        }
        for fill in &order.fills {
            debug!(
                price = %fill.price,
                qty = %fill.qty,
                commission = %fill.commission,
                asset = %fill.commission_asset,
                "order fill"
            );
        }

        // Some gateways omit the cumulative quote volume; rebuild it from fills.
        let quote_qty = if order.cummulative_quote_qty.is_zero() {
            order.fills.iter().map(|f| f.price * f.qty).sum()
        } else {
            order.cummulative_quote_qty
        };
        let avg_price = quote_qty / order.executed_qty;

        Ok(MarketOrderResult {
            order_id: order.order_id,
            symbol: order.symbol,
            side,
            executed_qty: order.executed_qty,
            avg_price,
            quote_qty,
            fills: order.fills,
        })
    }

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> Result<()> {
        self.request(
            Method::DELETE,
            "/api/v3/order",
            &format!("symbol={symbol}&orderId={order_id}"),
            true,
        )
        .await?;
        Ok(())
    }

    async fn get_order_status(&self, symbol: &str, order_id: u64) -> Result<OrderStatus> {
        let body = self
            .request(
                Method::GET,
                "/api/v3/order",
                &format!("symbol={symbol}&orderId={order_id}"),
                true,
            )
            .await?;
        let order: OrderQueryResponse =
            serde_json::from_str(&body).context("malformed order query response")?;
        Ok(order.status)
    }

    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> Result<Vec<Kline>> {
        let body = self
            .request(
                Method::GET,
                "/api/v3/klines",
                &format!("symbol={symbol}&interval={interval}&limit={limit}"),
                false,
            )
            .await?;

        parse_klines(&body)
    }
}

/// Klines arrive as positional arrays of mixed numbers and strings.
fn parse_klines(body: &str) -> Result<Vec<Kline>> {
    let raw: Vec<Vec<serde_json::Value>> =
        serde_json::from_str(body).context("malformed klines response")?;
    raw.into_iter()
        .map(|row| {
            let num = |i: usize| -> Result<i64> {
                row.get(i)
                    .and_then(serde_json::Value::as_i64)
                    .ok_or_else(|| anyhow!("kline field {i} missing"))
            };
            let dec = |i: usize| -> Result<Decimal> {
                row.get(i)
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| anyhow!("kline field {i} missing"))?
                    .parse()
                    .context("kline field is not a decimal")
            };
            Ok(Kline {
                open_time: num(0)?,
                open: dec(1)?,
                high: dec(2)?,
                low: dec(3)?,
                close: dec(4)?,
                volume: dec(5)?,
                close_time: num(6)?,
            })
        })
        .collect()
}
