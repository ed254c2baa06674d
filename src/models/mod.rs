//! Core data models.

mod market;
mod position;

pub use market::{AssetBalance, MarketExtras, MarketSnapshot};
pub use position::{Phase, Position, Side, StopLossReason};
