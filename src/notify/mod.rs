//! Outbound event notifications.
//!
//! Delivery is best effort: failures are logged and never surface to the
//! trading path.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::lifecycle::ExitReason;

/// Lifecycle events worth telling a human about.
#[derive(Debug, Clone)]
pub enum Notification {
    BotStarted { symbol: String, positions_recovered: usize },
    BotStopped,
    PositionOpened {
        id: String,
        symbol: String,
        entry_price: Decimal,
        quantity: Decimal,
        trade_amount_usd: Decimal,
        target_profit_usd: Decimal,
        stop_loss_price: Decimal,
    },
    PositionClosed {
        id: String,
        symbol: String,
        reason: ExitReason,
        exit_price: Decimal,
        profit_usd: Decimal,
    },
    TrailingActivated {
        id: String,
        symbol: String,
        profit_usd: Decimal,
    },
    CriticalError { context: String, message: String },
}

impl Notification {
    fn render(&self) -> String {
        match self {
            Notification::BotStarted { symbol, positions_recovered } => format!(
                "🤖 Bot started\nSymbol: {symbol}\nRecovered positions: {positions_recovered}"
            ),
            Notification::BotStopped => "🛑 Bot stopped".to_string(),
            Notification::PositionOpened {
                id,
                symbol,
                entry_price,
                quantity,
                trade_amount_usd,
                target_profit_usd,
                stop_loss_price,
            } => format!(
                "📈 Position opened\nId: {id}\nSymbol: {symbol}\nEntry: ${entry_price}\n\
                 Quantity: {quantity}\nAmount: ${trade_amount_usd}\n\
                 Target: ${target_profit_usd}\nStop loss: ${stop_loss_price}"
            ),
            Notification::PositionClosed { id, symbol, reason, exit_price, profit_usd } => {
                let emoji = if profit_usd.is_sign_negative() { "🔴" } else { "🟢" };
                format!(
                    "{emoji} Position closed ({reason})\nId: {id}\nSymbol: {symbol}\n\
                     Exit: ${exit_price}\nProfit: ${profit_usd}"
                )
            }
            Notification::TrailingActivated { id, symbol, profit_usd } => format!(
                "🎯 Trailing activated\nId: {id}\nSymbol: {symbol}\nProfit: ${profit_usd}"
            ),
            Notification::CriticalError { context, message } => {
                format!("🚨 Critical error\nContext: {context}\n{message}")
            }
        }
    }
}

/// Sink for lifecycle notifications. Infallible by contract; implementations
/// log their own delivery failures.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn send(&self, notification: Notification);
}

/// Sink that only writes to the log. Used when Telegram is not configured.
pub struct LogNotifier;

#[async_trait]
impl NotificationSink for LogNotifier {
    async fn send(&self, notification: Notification) {
        info!(message = %notification.render(), "notification");
    }
}

/// Telegram bot-API notifier.
pub struct TelegramNotifier {
    http: Client,
    bot_token: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(bot_token: String, chat_id: String) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { http, bot_token, chat_id })
    }

    /// Build a notifier from `TELEGRAM_BOT_TOKEN` / `TELEGRAM_CHAT_ID`.
    /// Returns `None` when either variable is missing.
    pub fn from_env() -> Option<anyhow::Result<Self>> {
        let bot_token = std::env::var("TELEGRAM_BOT_TOKEN").ok()?;
        let chat_id = std::env::var("TELEGRAM_CHAT_ID").ok()?;
        Some(Self::new(bot_token, chat_id))
    }
}

#[async_trait]
impl NotificationSink for TelegramNotifier {
    async fn send(&self, notification: Notification) {
        let text = notification.render();
        let url = format!("https://api.telegram.org/bot{}/sendMessage", self.bot_token);
        let result = self
            .http
            .post(&url)
            .form(&[("chat_id", self.chat_id.as_str()), ("text", text.as_str())])
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                debug!("telegram notification delivered");
            }
            Ok(response) => {
                warn!(status = %response.status(), "telegram rejected notification");
            }
            Err(e) => {
                warn!(error = %e, "failed to deliver telegram notification");
            }
        }
    }
}
