//! Exchange connectivity: REST trading client and market-data stream.

mod binance;
mod stream;

pub use binance::BinanceRestClient;
pub use stream::BinanceStreamClient;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Order direction on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        })
    }
}

/// One partial fill of a market order.
#[derive(Debug, Clone, Deserialize)]
pub struct Fill {
    #[serde(with = "rust_decimal::serde::str")]
    pub price: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub qty: Decimal,
    #[serde(with = "rust_decimal::serde::str")]
    pub commission: Decimal,
    #[serde(rename = "commissionAsset")]
    pub commission_asset: String,
}

/// Result of a filled market order.
#[derive(Debug, Clone)]
pub struct MarketOrderResult {
    pub order_id: u64,
    pub symbol: String,
    pub side: OrderSide,
    /// Quantity actually executed.
    pub executed_qty: Decimal,
    /// Volume-weighted average fill price.
    pub avg_price: Decimal,
    /// Total quote volume across fills.
    pub quote_qty: Decimal,
    pub fills: Vec<Fill>,
}

/// Lifecycle status of an order on the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

/// One candlestick.
#[derive(Debug, Clone)]
pub struct Kline {
    pub open_time: i64,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
    pub close_time: i64,
}

/// REST surface the bot and workers depend on. Implemented by the live
/// Binance client; tests substitute their own.
#[async_trait]
pub trait ExchangeRestClient: Send + Sync {
    /// Cheap connectivity and credential check.
    async fn test_connection(&self) -> anyhow::Result<()>;

    /// Latest traded price for a symbol.
    async fn get_price(&self, symbol: &str) -> anyhow::Result<Decimal>;

    /// Free balance of one asset.
    async fn get_balance(&self, asset: &str) -> anyhow::Result<Decimal>;

    /// Place a market order and wait for the fill response.
    async fn place_market_order(
        &self,
        symbol: &str,
        side: OrderSide,
        quantity: Decimal,
    ) -> anyhow::Result<MarketOrderResult>;

    async fn cancel_order(&self, symbol: &str, order_id: u64) -> anyhow::Result<()>;

    async fn get_order_status(&self, symbol: &str, order_id: u64) -> anyhow::Result<OrderStatus>;

    /// Recent candles, most recent last.
    async fn get_klines(
        &self,
        symbol: &str,
        interval: &str,
        limit: u16,
    ) -> anyhow::Result<Vec<Kline>>;
}
