//! Bot orchestration: startup, recovery, position creation and shutdown.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::config::BotConfig;
use crate::exchange::{
    BinanceRestClient, BinanceStreamClient, ExchangeRestClient, OrderSide,
};
use crate::lifecycle::{ExitReason, PositionStateMachine};
use crate::models::{AssetBalance, Phase, Position};
use crate::notify::{Notification, NotificationSink};
use crate::risk::{RiskAssessment, RiskEngine};
use crate::state::{SharedStateStore, AUTOSAVE_INTERVAL};
use crate::worker::{PositionWorker, Supervisor};

const BALANCE_REFRESH_INTERVAL: Duration = Duration::from_secs(30);
const WORKER_STOP_GRACE: Duration = Duration::from_secs(10);

pub struct Bot {
    config: BotConfig,
    store: Arc<SharedStateStore>,
    exchange: Arc<dyn ExchangeRestClient>,
    notifier: Arc<dyn NotificationSink>,
    supervisor: Arc<Supervisor>,
    risk: RiskEngine,
    shutdown: Arc<AtomicBool>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        exchange: Arc<dyn ExchangeRestClient>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let store = Arc::new(SharedStateStore::new(&config.data_dir)?);
        Ok(Self {
            config,
            store,
            exchange,
            notifier,
            supervisor: Arc::new(Supervisor::new()),
            risk: RiskEngine::default(),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn store(&self) -> &Arc<SharedStateStore> {
        &self.store
    }

    /// Price of the fee asset in quote currency, plus its free balance.
    async fn fee_asset_inputs(&self) -> Result<(Decimal, Decimal)> {
        let balance = self.exchange.get_balance(&self.config.fee_asset).await?;
        let price = self
            .exchange
            .get_price(&self.config.fee_asset_symbol())
            .await?;
        Ok((balance, price))
    }

    /// Run the full pre-trade assessment without trading.
    pub async fn assess(
        &self,
        trade_amount_usd: Decimal,
        target_profit_usd: Decimal,
    ) -> Result<String> {
        let entry_price = self.exchange.get_price(&self.config.symbol).await?;
        let (fee_balance, fee_price) = self.fee_asset_inputs().await?;

        let assessment = self
            .risk
            .check_viability(
                trade_amount_usd,
                target_profit_usd,
                entry_price,
                fee_balance,
                fee_price,
                self.config.min_trade_amount_usd,
            )
            .map_err(|e| anyhow!("trade not viable: {e}"))?;

        let mut report = self
            .risk
            .format_risk_report(trade_amount_usd, entry_price, &assessment);
        report.push_str(&self.market_context().await);
        Ok(report)
    }

    /// Recent market context appended to the risk report. Best effort; an
    /// empty string when candles are unavailable.
    async fn market_context(&self) -> String {
        let klines = match self.exchange.get_klines(&self.config.symbol, "1h", 24).await {
            Ok(klines) => klines,
            Err(e) => {
                warn!(error = %e, "could not fetch candles for market context");
                return String::new();
            }
        };
        let (Some(first), Some(last)) = (klines.first(), klines.last()) else {
            return String::new();
        };

        let high = klines.iter().map(|k| k.high).max().unwrap_or(last.close);
        let low = klines.iter().map(|k| k.low).min().unwrap_or(last.close);
        let volume: Decimal = klines.iter().map(|k| k.volume).sum();
        let span_hours = (last.close_time - first.open_time) / 3_600_000;
        let change_pct = if first.open.is_zero() {
            Decimal::ZERO
        } else {
            (last.close - first.open) / first.open * Decimal::from(100)
        };

        format!(
            "\nMarket ({span_hours}h): range ${low} - ${high}, change {:.2}%, volume {volume}",
            change_pct
        )
    }

    /// Open a new position and hand it to a worker.
    ///
    /// With an explicit amount the viability gate alone decides; without one
    /// the sizing ladder picks the amount. The buy order goes out before any
    /// store mutation; if persisting the record or starting its worker fails
    /// afterwards, the position is flattened again with a compensating sell.
    pub async fn open_position(
        &self,
        trade_amount_usd: Option<Decimal>,
        target_profit_usd: Option<Decimal>,
    ) -> Result<Position> {
        let open = self.store.list_positions().await.len();
        if open >= self.config.max_concurrent_positions {
            bail!(
                "position limit reached ({open}/{})",
                self.config.max_concurrent_positions
            );
        }

        let target_profit_usd = target_profit_usd.unwrap_or(self.config.target_profit_usd);
        let entry_price = self.exchange.get_price(&self.config.symbol).await?;
        let quote_balance = self.exchange.get_balance(&self.config.quote_asset).await?;
        let (fee_balance, fee_price) = self.fee_asset_inputs().await?;

        let (trade_amount_usd, assessment): (Decimal, RiskAssessment) = match trade_amount_usd {
            Some(amount) => {
                let assessment = self
                    .risk
                    .check_viability(
                        amount,
                        target_profit_usd,
                        entry_price,
                        fee_balance,
                        fee_price,
                        self.config.min_trade_amount_usd,
                    )
                    .map_err(|e| anyhow!("trade not viable: {e}"))?;
                (amount, assessment)
            }
            None => {
                let size = self
                    .risk
                    .calculate_position_size(
                        quote_balance,
                        entry_price,
                        target_profit_usd,
                        self.config.risk_percent,
                        fee_balance,
                        fee_price,
                    )
                    .ok_or_else(|| anyhow!("no viable position size for current balance"))?;
                info!(
                    trade_amount = %size.trade_amount_usd,
                    quantity = %size.quantity,
                    risk_amount = %size.risk_amount_usd,
                    risk_pct = %size.risk_percent_of_balance.round_dp(2),
                    "position sized from balance"
                );
                (size.trade_amount_usd, size.assessment)
            }
        };

        if quote_balance < trade_amount_usd {
            bail!(
                "insufficient {} balance: {quote_balance} < {trade_amount_usd}",
                self.config.quote_asset
            );
        }

        info!(
            "{}",
            self.risk
                .format_risk_report(trade_amount_usd, entry_price, &assessment)
        );

        let quantity = BinanceRestClient::round_quantity(
            &self.config.symbol,
            trade_amount_usd / entry_price,
        )
        .ok_or_else(|| anyhow!("computed quantity below exchange minimum"))?;

        let order = self
            .exchange
            .place_market_order(&self.config.symbol, OrderSide::Buy, quantity)
            .await
            .context("entry order failed")?;

        let mut position = Position::new(
            &self.config.symbol,
            order.avg_price,
            order.executed_qty,
            order.quote_qty,
            target_profit_usd,
            &assessment,
        );
        // The fill is confirmed, skip straight past the entering phase.
        position.phase = Phase::WaitingProfit;

        if let Err(e) = self.store.add_position(position.clone()).await {
            error!(
                position_id = %position.id,
                error = %e,
                "state write failed after entry fill, unwinding"
            );
            self.unwind_entry(&position).await;
            return Err(e);
        }
        self.refresh_balances().await;

        let worker = PositionWorker::new(
            &position,
            Arc::clone(&self.store),
            Arc::clone(&self.exchange),
            Arc::clone(&self.notifier),
        );
        if let Err(e) = self.supervisor.start_worker(worker).await {
            error!(position_id = %position.id, error = %e, "worker start failed, unwinding entry");
            self.unwind_entry(&position).await;
            return Err(e);
        }

        self.notifier
            .send(Notification::PositionOpened {
                id: position.id.clone(),
                symbol: position.symbol.clone(),
                entry_price: position.entry_price,
                quantity: position.quantity,
                trade_amount_usd: position.trade_amount_usd,
                target_profit_usd: position.target_profit_usd,
                stop_loss_price: position.stop_loss_price,
            })
            .await;

        info!(
            position_id = %position.id,
            entry_price = %position.entry_price,
            quantity = %position.quantity,
            "position opened"
        );
        Ok(position)
    }

    /// Compensating sell after a partially-completed open. Failure here
    /// leaves the filled position in the store for its recovery on restart.
    async fn unwind_entry(&self, position: &Position) {
        match self
            .exchange
            .place_market_order(&position.symbol, OrderSide::Sell, position.quantity)
            .await
        {
            Ok(_) => {
                if let Err(e) = self.store.remove_position(&position.id).await {
                    error!(position_id = %position.id, error = %e, "failed to remove unwound position");
                }
            }
            Err(e) => {
                error!(position_id = %position.id, error = %e, "compensating sell failed");
                self.notifier
                    .send(Notification::CriticalError {
                        context: format!("unwinding entry of {}", position.id),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    }

    /// Manually close one open position at market.
    pub async fn close_position(&self, position_id: &str) -> Result<()> {
        let position = self
            .store
            .get_position(position_id)
            .await
            .ok_or_else(|| anyhow!("no such position: {position_id}"))?;

        self.supervisor
            .stop_worker(position_id, WORKER_STOP_GRACE)
            .await;

        // The worker may have closed it while stopping.
        if self.store.get_position(position_id).await.is_none() {
            return Ok(());
        }

        let order = self
            .exchange
            .place_market_order(&position.symbol, OrderSide::Sell, position.quantity)
            .await
            .context("close order failed")?;
        // Fall back to the last known price when the ack carries no fill data.
        let exit_price = if order.avg_price.is_zero() {
            position.current_price
        } else {
            order.avg_price
        };
        let quote_qty = if order.quote_qty.is_zero() {
            exit_price * order.executed_qty
        } else {
            order.quote_qty
        };
        let realized = quote_qty - position.entry_price * order.executed_qty;

        PositionStateMachine::complete(&self.store, position_id, exit_price, realized).await?;
        self.notifier
            .send(Notification::PositionClosed {
                id: position.id.clone(),
                symbol: position.symbol,
                reason: ExitReason::Manual,
                exit_price,
                profit_usd: realized,
            })
            .await;
        Ok(())
    }

    /// Restart a worker for every position recovered from disk.
    async fn recover_positions(&self) -> Result<usize> {
        let positions = self.store.list_positions().await;
        let mut recovered = 0;

        for position in positions {
            // Positions opened in this process already have their worker.
            if self.supervisor.is_running(&position.id).await {
                continue;
            }
            info!(
                position_id = %position.id,
                phase = ?position.phase,
                "recovering position"
            );
            let worker = PositionWorker::new(
                &position,
                Arc::clone(&self.store),
                Arc::clone(&self.exchange),
                Arc::clone(&self.notifier),
            );
            match self.supervisor.start_worker(worker).await {
                Ok(()) => recovered += 1,
                Err(e) => {
                    error!(position_id = %position.id, error = %e, "failed to recover position")
                }
            }
        }
        Ok(recovered)
    }

    async fn refresh_balances(&self) {
        let assets = [
            self.config.quote_asset.clone(),
            self.config.base_asset().to_string(),
            self.config.fee_asset.clone(),
        ];

        let mut balances = HashMap::new();
        for asset in assets {
            match self.exchange.get_balance(&asset).await {
                Ok(free) => {
                    balances.insert(asset, AssetBalance::new(free, Decimal::ZERO));
                }
                Err(e) => warn!(%asset, error = %e, "balance refresh failed"),
            }
        }
        if !balances.is_empty() {
            self.store.update_balances(balances).await;
        }
    }

    /// Main loop: recover state, run the price stream, supervise workers,
    /// shut down cleanly on ctrl-c.
    pub async fn run(&self) -> Result<()> {
        self.exchange
            .test_connection()
            .await
            .context("exchange connectivity check failed")?;

        self.store.load().await?;
        self.store.set_bot_running(true).await?;
        let recovered = self.recover_positions().await?;
        self.refresh_balances().await;
        self.store.start_autosave(AUTOSAVE_INTERVAL).await;

        let stream = BinanceStreamClient::new(
            Arc::clone(&self.store),
            vec![self.config.symbol.clone(), self.config.fee_asset_symbol()],
            self.config.testnet,
        );
        let stream_shutdown = Arc::clone(&self.shutdown);
        let stream_task = tokio::spawn(async move { stream.run(stream_shutdown).await });

        self.notifier
            .send(Notification::BotStarted {
                symbol: self.config.symbol.clone(),
                positions_recovered: recovered,
            })
            .await;
        info!(
            symbol = %self.config.symbol,
            recovered,
            testnet = self.config.testnet,
            "bot running"
        );

        let mut refresh = tokio::time::interval(BALANCE_REFRESH_INTERVAL);
        refresh.tick().await;
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown signal received");
                    break;
                }
                _ = refresh.tick() => {
                    self.refresh_balances().await;
                    let workers = self.supervisor.status().await;
                    for worker in &workers {
                        tracing::debug!(
                            position_id = %worker.position_id,
                            running = worker.running,
                            "worker alive"
                        );
                    }
                    let positions = self.store.list_positions().await.len();
                    info!(workers = workers.len(), positions, "heartbeat");
                }
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        self.supervisor.shutdown_all(WORKER_STOP_GRACE).await;
        let _ = stream_task.await;

        self.store.set_bot_running(false).await?;
        self.store.set_stream_connected(false).await;
        self.store.stop_autosave().await;
        self.store.save(true).await?;
        self.notifier.send(Notification::BotStopped).await;
        info!("bot stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::{Fill, Kline, MarketOrderResult, OrderStatus};
    use crate::notify::LogNotifier;
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::sync::Mutex;

    struct StubExchange {
        price: Decimal,
        fee_price: Decimal,
        quote_balance: Decimal,
        fee_balance: Decimal,
        fail_orders: bool,
        orders: Mutex<Vec<(OrderSide, Decimal)>>,
    }

    impl StubExchange {
        fn healthy() -> Self {
            Self {
                price: dec!(60000),
                fee_price: dec!(300),
                quote_balance: dec!(10000),
                fee_balance: dec!(1),
                fail_orders: false,
                orders: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl ExchangeRestClient for StubExchange {
        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
        async fn get_price(&self, symbol: &str) -> Result<Decimal> {
            Ok(if symbol.starts_with("BNB") {
                self.fee_price
            } else {
                self.price
            })
        }
        async fn get_balance(&self, asset: &str) -> Result<Decimal> {
            Ok(match asset {
                "USDT" => self.quote_balance,
                "BNB" => self.fee_balance,
                _ => Decimal::ZERO,
            })
        }
        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            quantity: Decimal,
        ) -> Result<MarketOrderResult> {
            if self.fail_orders {
                anyhow::bail!("order rejected");
            }
            self.orders.lock().unwrap().push((side, quantity));
            Ok(MarketOrderResult {
                order_id: 42,
                symbol: symbol.to_string(),
                side,
                executed_qty: quantity,
                avg_price: self.price,
                quote_qty: self.price * quantity,
                fills: Vec::<Fill>::new(),
            })
        }
        async fn cancel_order(&self, _s: &str, _o: u64) -> Result<()> {
            Ok(())
        }
        async fn get_order_status(&self, _s: &str, _o: u64) -> Result<OrderStatus> {
            Ok(OrderStatus::Filled)
        }
        async fn get_klines(&self, _s: &str, _i: &str, _l: u16) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl NotificationSink for RecordingNotifier {
        async fn send(&self, notification: Notification) {
            self.sent.lock().unwrap().push(notification);
        }
    }

    fn test_bot(exchange: Arc<StubExchange>) -> (tempfile::TempDir, Bot) {
        let dir = tempfile::tempdir().unwrap();
        let config = BotConfig {
            data_dir: dir.path().to_path_buf(),
            ..BotConfig::default()
        };
        let bot = Bot::new(config, exchange, Arc::new(LogNotifier)).unwrap();
        (dir, bot)
    }

    #[tokio::test]
    async fn test_open_position_places_buy_and_starts_worker() {
        let exchange = Arc::new(StubExchange::healthy());
        let (_dir, bot) = test_bot(exchange.clone());

        let position = bot
            .open_position(Some(dec!(1000)), Some(dec!(50)))
            .await
            .unwrap();

        assert_eq!(position.phase, Phase::WaitingProfit);
        assert_eq!(position.symbol, "BTCUSDT");
        assert!(position.stop_loss_price < position.entry_price);

        let orders = exchange.orders.lock().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].0, OrderSide::Buy);
        drop(orders);

        assert!(bot.store.get_position(&position.id).await.is_some());
        assert_eq!(bot.supervisor.status().await.len(), 1);

        bot.supervisor.shutdown_all(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_open_position_rejects_non_viable_trade() {
        // In the discount range but far below the required safety margin.
        let exchange = Arc::new(StubExchange {
            fee_balance: dec!(0.002),
            ..StubExchange::healthy()
        });
        let (_dir, bot) = test_bot(exchange.clone());

        let err = bot
            .open_position(Some(dec!(1000)), Some(dec!(50)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not viable"));
        // No order went out.
        assert!(exchange.orders.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_open_position_enforces_concurrency_cap() {
        let exchange = Arc::new(StubExchange::healthy());
        let (_dir, bot) = test_bot(exchange);

        for _ in 0..bot.config.max_concurrent_positions {
            bot.open_position(Some(dec!(1000)), Some(dec!(50)))
                .await
                .unwrap();
        }

        let err = bot
            .open_position(Some(dec!(1000)), Some(dec!(50)))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("position limit reached"));

        bot.supervisor.shutdown_all(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_open_position_unwinds_buy_when_state_write_fails() {
        let exchange = Arc::new(StubExchange::healthy());
        let (dir, bot) = test_bot(exchange.clone());
        // A directory at the state-file path makes every flush fail.
        std::fs::create_dir(dir.path().join("system_state.json")).unwrap();

        assert!(bot
            .open_position(Some(dec!(1000)), Some(dec!(50)))
            .await
            .is_err());

        // The filled entry was compensated and nothing lingers.
        let orders = exchange.orders.lock().unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(orders[0].0, OrderSide::Buy);
        assert_eq!(orders[1].0, OrderSide::Sell);
        assert_eq!(orders[0].1, orders[1].1);
        drop(orders);

        assert!(bot.store.list_positions().await.is_empty());
        assert!(bot.supervisor.status().await.is_empty());
    }

    #[tokio::test]
    async fn test_close_position_reports_manual_close() {
        let exchange = Arc::new(StubExchange::healthy());
        let dir = tempfile::tempdir().unwrap();
        let config = BotConfig {
            data_dir: dir.path().to_path_buf(),
            ..BotConfig::default()
        };
        let notifier = Arc::new(RecordingNotifier::default());
        let bot = Bot::new(config, exchange.clone(), notifier.clone()).unwrap();

        let position = bot
            .open_position(Some(dec!(1000)), Some(dec!(50)))
            .await
            .unwrap();
        bot.close_position(&position.id).await.unwrap();

        assert!(bot.store.get_position(&position.id).await.is_none());
        let sent = notifier.sent.lock().unwrap();
        assert!(sent.iter().any(|n| matches!(
            n,
            Notification::PositionClosed { reason: ExitReason::Manual, .. }
        )));
    }

    #[tokio::test]
    async fn test_assess_reports_viable_trade() {
        let exchange = Arc::new(StubExchange::healthy());
        let (_dir, bot) = test_bot(exchange);

        let report = bot.assess(dec!(1000), dec!(50)).await.unwrap();
        assert!(report.contains("RISK ANALYSIS"));
        assert!(report.contains("Risk/Reward"));
    }

    #[tokio::test]
    async fn test_recover_positions_restarts_workers() {
        let exchange = Arc::new(StubExchange::healthy());
        let (_dir, bot) = test_bot(exchange.clone());

        let position = bot
            .open_position(Some(dec!(1000)), Some(dec!(50)))
            .await
            .unwrap();
        bot.supervisor.shutdown_all(Duration::from_secs(5)).await;
        assert_eq!(bot.supervisor.status().await.len(), 0);

        let recovered = bot.recover_positions().await.unwrap();
        assert_eq!(recovered, 1);
        assert_eq!(bot.supervisor.status().await.len(), 1);
        assert!(bot.store.get_position(&position.id).await.is_some());

        bot.supervisor.shutdown_all(Duration::from_secs(5)).await;
    }
}
