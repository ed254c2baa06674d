//! Spot-Guard Trading Bot
//!
//! Opens long spot positions with pre-computed risk limits and manages each
//! one through a trailing-stop lifecycle, surviving restarts through a
//! file-backed shared state store.

mod bot;
mod config;
mod exchange;
mod lifecycle;
mod models;
mod notify;
mod risk;
mod state;
mod worker;

use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use rust_decimal::Decimal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::bot::Bot;
use crate::config::BotConfig;
use crate::exchange::BinanceRestClient;
use crate::lifecycle::PositionSummary;
use crate::notify::{LogNotifier, NotificationSink, TelegramNotifier};
use crate::state::SharedStateStore;

/// Spot trading bot CLI.
#[derive(Parser)]
#[command(name = "spotguard")]
#[command(about = "Trailing-stop spot trading bot", long_about = None)]
struct Cli {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", env = "BOT_LOG_LEVEL")]
    log_level: String,

    /// Trading pair, overrides BOT_SYMBOL
    #[arg(short, long)]
    symbol: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bot: recover persisted positions and monitor them
    Run,

    /// Open a new position
    Open {
        /// Trade amount in quote currency; sized from balance when omitted
        #[arg(short, long)]
        amount: Option<Decimal>,

        /// Profit target in quote currency
        #[arg(short, long)]
        target: Option<Decimal>,
    },

    /// Close one open position at market
    Close {
        /// Position id, e.g. pos-1700000000000-1f9a3c
        id: String,
    },

    /// Run the pre-trade risk assessment without trading
    Assess {
        /// Trade amount in quote currency
        #[arg(short, long)]
        amount: Decimal,

        /// Profit target in quote currency
        #[arg(short, long)]
        target: Option<Decimal>,
    },

    /// Show persisted positions and system flags
    Status,

    /// Show the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = BotConfig::from_env()?;
    if let Some(symbol) = cli.symbol {
        config.symbol = symbol.to_uppercase();
    }

    match cli.command {
        Commands::Run => {
            let bot = build_bot(config)?;
            bot.run().await?;
        }

        Commands::Open { amount, target } => {
            let bot = build_bot(config)?;
            bot.store().load().await?;
            let position = bot.open_position(amount, target).await?;
            println!("Opened {} on {}", position.id, position.symbol);
            println!("  Entry:     ${}", position.entry_price);
            println!("  Quantity:  {}", position.quantity);
            println!("  Target:    ${}", position.target_profit_usd);
            println!("  Stop loss: ${}", position.stop_loss_price);
            info!("position handed to a worker; keep `run` active to manage it");
            bot.run().await?;
        }

        Commands::Close { id } => {
            let bot = build_bot(config)?;
            bot.store().load().await?;
            bot.close_position(&id).await?;
            println!("Closed {id}");
        }

        Commands::Assess { amount, target } => {
            let bot = build_bot(config.clone())?;
            let report = bot
                .assess(amount, target.unwrap_or(config.target_profit_usd))
                .await?;
            println!("{report}");
        }

        Commands::Status => {
            let store = SharedStateStore::new(&config.data_dir)?;
            store.load().await?;
            print_status(&store, &config).await;
        }

        Commands::Config => {
            println!("Symbol:           {}", config.symbol);
            println!("Quote asset:      {}", config.quote_asset);
            println!("Fee asset:        {}", config.fee_asset);
            println!("Target profit:    ${}", config.target_profit_usd);
            println!("Risk per trade:   {}%", config.risk_percent);
            println!("Min trade amount: ${}", config.min_trade_amount_usd);
            println!("Max positions:    {}", config.max_concurrent_positions);
            println!("Data dir:         {}", config.data_dir.display());
            println!("Testnet:          {}", config.testnet);
        }
    }

    Ok(())
}

fn build_bot(config: BotConfig) -> Result<Bot> {
    let exchange = Arc::new(BinanceRestClient::from_env(config.testnet)?);
    let notifier: Arc<dyn NotificationSink> = match TelegramNotifier::from_env() {
        Some(notifier) => Arc::new(notifier?),
        None => {
            info!("telegram not configured, notifications go to the log");
            Arc::new(LogNotifier)
        }
    };
    Bot::new(config, exchange, notifier)
}

async fn print_status(store: &SharedStateStore, config: &BotConfig) {
    let info = store.system_info().await;
    println!("Bot running:      {}", info.bot_running);
    println!("Stream connected: {}", info.stream_connected);
    println!("Active positions: {}", info.active_positions);
    println!("Last update:      {}", info.last_update);

    for asset in [&config.quote_asset, &config.fee_asset] {
        if let Some(balance) = store.get_balance(asset).await {
            println!("{asset} balance:     {} free, {} locked", balance.free, balance.locked);
        }
    }

    let positions = store.list_positions().await;
    if positions.is_empty() {
        return;
    }

    println!(
        "\n{:<20} {:<10} {:<15} {:>12} {:>12} {:>12} {:>10}  {}",
        "ID", "SYMBOL", "PHASE", "ENTRY", "PRICE", "PROFIT", "AGE(MIN)", "DETAIL"
    );
    println!("{}", "-".repeat(112));
    for position in &positions {
        let summary = PositionSummary::of(position);
        let detail = if let Some(pct) = summary.progress_to_target_pct {
            format!("{:.1}% of ${} target", pct, summary.target_profit_usd)
        } else if let Some(buffer) = summary.trailing_buffer_usd {
            format!("${buffer} below peak")
        } else {
            String::new()
        };
        println!(
            "{:<20} {:<10} {:<15} {:>12} {:>12} {:>12} {:>10}  {}",
            summary.id,
            summary.symbol,
            format!("{:?}", summary.phase),
            format!("${}", summary.entry_price),
            format!("${}", summary.current_price),
            format!("${}", summary.current_profit_usd),
            summary.age_minutes,
            detail,
        );
    }
}
