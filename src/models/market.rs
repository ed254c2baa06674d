//! Market and balance snapshots held by the shared state store.
//!
//! Both are overwritten wholesale on each update; no history is retained.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Latest known market data for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketSnapshot {
    pub price: Decimal,
    /// Epoch seconds when this sample was taken.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<Decimal>,
}

/// Optional extras attached to a market update.
#[derive(Debug, Clone, Default)]
pub struct MarketExtras {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub volume: Option<Decimal>,
    pub change_24h: Option<Decimal>,
}

impl MarketSnapshot {
    pub fn now(price: Decimal, extras: MarketExtras) -> Self {
        Self {
            price,
            timestamp: Utc::now().timestamp(),
            bid: extras.bid,
            ask: extras.ask,
            volume: extras.volume,
            change_24h: extras.change_24h,
        }
    }

    /// Seconds since this snapshot was taken.
    pub fn age_secs(&self) -> i64 {
        Utc::now().timestamp() - self.timestamp
    }
}

/// Free/locked balance for one asset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBalance {
    pub free: Decimal,
    pub locked: Decimal,
    pub total: Decimal,
}

impl AssetBalance {
    pub fn new(free: Decimal, locked: Decimal) -> Self {
        Self {
            free,
            locked,
            total: free + locked,
        }
    }
}
