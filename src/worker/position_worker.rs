//! Per-position monitoring loop.
//!
//! One worker owns exactly one position: it samples the price every two
//! seconds, runs the state machine, persists live fields, and executes the
//! closing order when an exit triggers. The worker exits when its position
//! leaves the store or is already completed, when it is told to stop, or when
//! its error budget is exhausted.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use crate::exchange::{ExchangeRestClient, OrderSide};
use crate::lifecycle::{ExitReason, PositionStateMachine, TickOutcome};
use crate::models::{MarketExtras, Phase, Position};
use crate::notify::{Notification, NotificationSink};
use crate::state::SharedStateStore;

const TICK_INTERVAL: Duration = Duration::from_secs(2);
const PERSIST_INTERVAL: Duration = Duration::from_secs(10);

/// Cached price younger than this is used as-is.
const FRESH_PRICE_MAX_AGE: i64 = 3;
/// Cached price younger than this is still acceptable when REST fails.
const STALE_PRICE_MAX_AGE: i64 = 30;

/// Consecutive failed ticks before the position is force-closed.
const MAX_CONSECUTIVE_ERRORS: u32 = 10;
const MAX_ERROR_SLEEP: Duration = Duration::from_secs(30);

pub struct PositionWorker {
    position_id: String,
    symbol: String,
    store: Arc<SharedStateStore>,
    exchange: Arc<dyn ExchangeRestClient>,
    notifier: Arc<dyn NotificationSink>,
}

impl PositionWorker {
    pub fn new(
        position: &Position,
        store: Arc<SharedStateStore>,
        exchange: Arc<dyn ExchangeRestClient>,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        Self {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            store,
            exchange,
            notifier,
        }
    }

    pub fn position_id(&self) -> &str {
        &self.position_id
    }

    /// Monitor the position until it closes or `stop` is set.
    pub async fn run(self, stop: Arc<AtomicBool>) {
        info!(position_id = %self.position_id, symbol = %self.symbol, "worker started");
        self.store
            .update_position(&self.position_id, |p| {
                p.owner_process_id = Some(std::process::id());
            })
            .await;

        let mut consecutive_errors: u32 = 0;
        let mut last_persist = Instant::now();

        while !stop.load(Ordering::SeqCst) {
            let Some(position) = self.store.get_position(&self.position_id).await else {
                debug!(position_id = %self.position_id, "position no longer in store");
                break;
            };
            // A completed record only survives here when its removal failed
            // to flush; it is already sold and must never be ticked again.
            if position.phase == Phase::Completed {
                warn!(position_id = %self.position_id, "position already completed, exiting");
                break;
            }

            match self.tick(position).await {
                Ok(TickResult::Closed) => break,
                Ok(TickResult::Open) => {
                    consecutive_errors = 0;
                }
                Err(e) => {
                    consecutive_errors += 1;
                    error!(
                        position_id = %self.position_id,
                        error = %e,
                        consecutive_errors,
                        "worker tick failed"
                    );
                    if consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                        self.emergency_close().await;
                        break;
                    }
                    let backoff = Duration::from_secs(2 * u64::from(consecutive_errors))
                        .min(MAX_ERROR_SLEEP);
                    tokio::time::sleep(backoff).await;
                    continue;
                }
            }

            if last_persist.elapsed() >= PERSIST_INTERVAL {
                if let Err(e) = self.store.save(false).await {
                    warn!(position_id = %self.position_id, error = %e, "periodic save failed");
                }
                last_persist = Instant::now();
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }

        // Leave no stale ownership behind; the final save captures whatever
        // state the position is in.
        if self.store.get_position(&self.position_id).await.is_some() {
            self.store
                .update_position(&self.position_id, |p| p.owner_process_id = None)
                .await;
        }
        if let Err(e) = self.store.save(true).await {
            warn!(position_id = %self.position_id, error = %e, "final save failed");
        }
        info!(position_id = %self.position_id, "worker stopped");
    }

    async fn tick(&self, mut position: Position) -> Result<TickResult> {
        let price = self.resolve_price().await?;
        let phase_before = position.phase;

        let outcome = PositionStateMachine::update(&mut position, price);

        let snapshot = position.clone();
        self.store
            .update_position(&self.position_id, move |p| {
                p.current_price = snapshot.current_price;
                p.current_profit_usd = snapshot.current_profit_usd;
                p.max_profit_usd = snapshot.max_profit_usd;
                p.phase = snapshot.phase;
            })
            .await;

        if phase_before == Phase::WaitingProfit && position.phase == Phase::Trailing {
            self.notifier
                .send(Notification::TrailingActivated {
                    id: position.id.clone(),
                    symbol: position.symbol.clone(),
                    profit_usd: position.current_profit_usd,
                })
                .await;
        }

        match outcome {
            TickOutcome::Continue => Ok(TickResult::Open),
            TickOutcome::Exit(reason) => {
                self.execute_exit(&position, phase_before, reason).await?;
                Ok(TickResult::Closed)
            }
        }
    }

    /// Latest price, preferring the shared cache fed by the stream.
    ///
    /// Order of preference: fresh cache, direct request written back to the
    /// cache, stale-but-recent cache, one last direct request.
    async fn resolve_price(&self) -> Result<Decimal> {
        if let Some(snapshot) = self.store.get_market(&self.symbol).await {
            if snapshot.age_secs() < FRESH_PRICE_MAX_AGE {
                return Ok(snapshot.price);
            }
        }

        match self.exchange.get_price(&self.symbol).await {
            Ok(price) => {
                self.store
                    .update_market(&self.symbol, price, MarketExtras::default())
                    .await;
                return Ok(price);
            }
            Err(e) => {
                warn!(symbol = %self.symbol, error = %e, "direct price fetch failed");
            }
        }

        if let Some(snapshot) = self.store.get_market(&self.symbol).await {
            if snapshot.age_secs() < STALE_PRICE_MAX_AGE {
                warn!(
                    symbol = %self.symbol,
                    age_secs = snapshot.age_secs(),
                    "using stale cached price"
                );
                return Ok(snapshot.price);
            }
        }

        self.exchange
            .get_price(&self.symbol)
            .await
            .with_context(|| format!("no usable price for {}", self.symbol))
    }

    /// Sell the position at market. On order failure the phase reverts to
    /// what it was before the exit decision so the next tick re-evaluates.
    async fn execute_exit(
        &self,
        position: &Position,
        phase_before: Phase,
        reason: ExitReason,
    ) -> Result<()> {
        info!(
            position_id = %position.id,
            %reason,
            quantity = %position.quantity,
            "executing exit order"
        );

        let order = match self
            .exchange
            .place_market_order(&position.symbol, OrderSide::Sell, position.quantity)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.store
                    .update_position(&position.id, move |p| p.phase = phase_before)
                    .await;
                return Err(anyhow!("exit order failed, phase reverted: {e}"));
            }
        };

        // Some gateways acknowledge the fill without fill data; fall back to
        // the price the exit decision was made at.
        let exit_price = if order.avg_price.is_zero() {
            warn!(
                position_id = %position.id,
                order_id = order.order_id,
                "fill data unavailable, using last known price"
            );
            position.current_price
        } else {
            order.avg_price
        };
        let quote_qty = if order.quote_qty.is_zero() {
            exit_price * order.executed_qty
        } else {
            order.quote_qty
        };
        info!(
            position_id = %position.id,
            order_id = order.order_id,
            symbol = %order.symbol,
            side = %order.side,
            exit_price = %exit_price,
            "exit order filled"
        );
        let realized_profit = quote_qty - position.entry_price * order.executed_qty;
        PositionStateMachine::complete(&self.store, &position.id, exit_price, realized_profit)
            .await?;

        self.notifier
            .send(Notification::PositionClosed {
                id: position.id.clone(),
                symbol: position.symbol.clone(),
                reason,
                exit_price,
                profit_usd: realized_profit,
            })
            .await;
        Ok(())
    }

    /// Last resort after the error budget is spent: try once to flatten the
    /// position. If even that fails the position stays in the store for
    /// manual intervention.
    async fn emergency_close(&self) {
        error!(position_id = %self.position_id, "error budget exhausted, emergency close");

        let Some(position) = self.store.get_position(&self.position_id).await else {
            return;
        };
        if let Err(e) = self
            .execute_exit(&position, position.phase, ExitReason::EmergencyExit)
            .await
        {
            error!(position_id = %self.position_id, error = %e, "emergency close failed");
            self.notifier
                .send(Notification::CriticalError {
                    context: format!("emergency close of {}", self.position_id),
                    message: e.to_string(),
                })
                .await;
        }
    }
}

enum TickResult {
    Open,
    Closed,
}
