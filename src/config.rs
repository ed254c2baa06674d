//! Runtime configuration, merged from environment variables and defaults.

use std::path::PathBuf;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// Bot-wide settings. CLI flags may override individual fields after load.
#[derive(Debug, Clone)]
pub struct BotConfig {
    /// Trading pair, e.g. `BTCUSDT`.
    pub symbol: String,
    /// Quote asset the pair settles in.
    pub quote_asset: String,
    /// Asset used to pay trading fees at the discounted rate.
    pub fee_asset: String,
    /// Default profit target per position in quote currency.
    pub target_profit_usd: Decimal,
    /// Percent of the free quote balance risked per position.
    pub risk_percent: Decimal,
    /// Smallest trade the bot will open.
    pub min_trade_amount_usd: Decimal,
    pub max_concurrent_positions: usize,
    pub data_dir: PathBuf,
    pub testnet: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            quote_asset: "USDT".to_string(),
            fee_asset: "BNB".to_string(),
            target_profit_usd: dec!(50),
            risk_percent: dec!(2),
            min_trade_amount_usd: dec!(10),
            max_concurrent_positions: 10,
            data_dir: PathBuf::from("data/state"),
            testnet: false,
        }
    }
}

impl BotConfig {
    /// Load settings from `BOT_*` environment variables, falling back to
    /// defaults for anything unset.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(symbol) = std::env::var("BOT_SYMBOL") {
            config.symbol = symbol.to_uppercase();
        }
        if let Ok(quote) = std::env::var("BOT_QUOTE_ASSET") {
            config.quote_asset = quote.to_uppercase();
        }
        if let Ok(target) = std::env::var("BOT_TARGET_PROFIT_USD") {
            config.target_profit_usd = target
                .parse()
                .context("BOT_TARGET_PROFIT_USD is not a valid decimal")?;
        }
        if let Ok(risk) = std::env::var("BOT_RISK_PERCENT") {
            config.risk_percent = risk
                .parse()
                .context("BOT_RISK_PERCENT is not a valid decimal")?;
        }
        if let Ok(max) = std::env::var("BOT_MAX_POSITIONS") {
            config.max_concurrent_positions =
                max.parse().context("BOT_MAX_POSITIONS is not a valid integer")?;
        }
        if let Ok(dir) = std::env::var("BOT_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(testnet) = std::env::var("BINANCE_TESTNET") {
            config.testnet = matches!(testnet.to_lowercase().as_str(), "1" | "true" | "yes");
        }

        Ok(config)
    }

    /// Symbol used to price the fee asset, e.g. `BNBUSDT`.
    pub fn fee_asset_symbol(&self) -> String {
        format!("{}{}", self.fee_asset, self.quote_asset)
    }

    /// Base asset of the trading pair, by stripping the quote suffix.
    pub fn base_asset(&self) -> &str {
        self.symbol
            .strip_suffix(&self.quote_asset)
            .unwrap_or(&self.symbol)
    }
}
