//! Worker task supervision.
//!
//! Tracks one tokio task per open position. Workers stop cooperatively via a
//! shared flag; a worker that ignores the flag past the grace period is
//! aborted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::PositionWorker;

struct WorkerHandle {
    stop: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// State of one supervised worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub position_id: String,
    pub running: bool,
}

#[derive(Default)]
pub struct Supervisor {
    workers: Mutex<HashMap<String, WorkerHandle>>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a worker task for the given position. Fails if a worker for the
    /// same position is already registered and still running.
    pub async fn start_worker(&self, worker: PositionWorker) -> Result<()> {
        let id = worker.position_id().to_string();
        let mut workers = self.workers.lock().await;

        if let Some(existing) = workers.get(&id) {
            if !existing.join.is_finished() {
                bail!("worker for position {id} is already running");
            }
            workers.remove(&id);
        }

        let stop = Arc::new(AtomicBool::new(false));
        let join = tokio::spawn(worker.run(Arc::clone(&stop)));
        workers.insert(id.clone(), WorkerHandle { stop, join });

        info!(position_id = %id, workers = workers.len(), "worker registered");
        Ok(())
    }

    /// Whether a live worker is registered for the position.
    pub async fn is_running(&self, position_id: &str) -> bool {
        self.workers
            .lock()
            .await
            .get(position_id)
            .is_some_and(|handle| !handle.join.is_finished())
    }

    /// Ask one worker to stop and wait up to `grace` for it to finish.
    /// Returns whether a worker was registered for the id.
    pub async fn stop_worker(&self, position_id: &str, grace: Duration) -> bool {
        let Some(handle) = self.workers.lock().await.remove(position_id) else {
            return false;
        };

        handle.stop.store(true, Ordering::SeqCst);
        let abort = handle.join.abort_handle();
        if tokio::time::timeout(grace, handle.join).await.is_err() {
            warn!(position_id, "worker did not stop in time, aborting");
            abort.abort();
        }
        info!(position_id, "worker stopped");
        true
    }

    /// Current view of all registered workers, dropping finished entries.
    pub async fn status(&self) -> Vec<WorkerStatus> {
        let mut workers = self.workers.lock().await;
        workers.retain(|_, handle| !handle.join.is_finished());
        let mut statuses: Vec<_> = workers
            .keys()
            .map(|id| WorkerStatus {
                position_id: id.clone(),
                running: true,
            })
            .collect();
        statuses.sort_by(|a, b| a.position_id.cmp(&b.position_id));
        statuses
    }

    /// Stop every worker, giving each the same grace period.
    pub async fn shutdown_all(&self, grace: Duration) {
        let drained: Vec<(String, WorkerHandle)> =
            self.workers.lock().await.drain().collect();

        for (_, handle) in &drained {
            handle.stop.store(true, Ordering::SeqCst);
        }
        for (id, handle) in drained {
            let abort = handle.join.abort_handle();
            if tokio::time::timeout(grace, handle.join).await.is_err() {
                warn!(position_id = %id, "worker did not stop in time during shutdown, aborting");
                abort.abort();
            }
        }
        info!("all workers stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Phase, Position, Side, StopLossReason};
    use crate::notify::LogNotifier;
    use crate::state::SharedStateStore;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    use crate::exchange::{
        ExchangeRestClient, Fill, Kline, MarketOrderResult, OrderSide, OrderStatus,
    };
    use async_trait::async_trait;

    struct FixedPriceExchange(Decimal);

    #[async_trait]
    impl ExchangeRestClient for FixedPriceExchange {
        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
        async fn get_price(&self, _symbol: &str) -> Result<Decimal> {
            Ok(self.0)
        }
        async fn get_balance(&self, _asset: &str) -> Result<Decimal> {
            Ok(dec!(10000))
        }
        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            quantity: Decimal,
        ) -> Result<MarketOrderResult> {
            Ok(MarketOrderResult {
                order_id: 1,
                symbol: symbol.to_string(),
                side,
                executed_qty: quantity,
                avg_price: self.0,
                quote_qty: self.0 * quantity,
                fills: Vec::<Fill>::new(),
            })
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: u64) -> Result<()> {
            Ok(())
        }
        async fn get_order_status(&self, _s: &str, _o: u64) -> Result<OrderStatus> {
            Ok(OrderStatus::Filled)
        }
        async fn get_klines(&self, _s: &str, _i: &str, _l: u16) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }
    }

    /// Exchange whose price endpoint hangs long enough to outlive any
    /// reasonable grace period.
    struct SlowExchange;

    #[async_trait]
    impl ExchangeRestClient for SlowExchange {
        async fn test_connection(&self) -> Result<()> {
            Ok(())
        }
        async fn get_price(&self, _symbol: &str) -> Result<Decimal> {
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(dec!(1010))
        }
        async fn get_balance(&self, _asset: &str) -> Result<Decimal> {
            Ok(dec!(10000))
        }
        async fn place_market_order(
            &self,
            symbol: &str,
            side: OrderSide,
            quantity: Decimal,
        ) -> Result<MarketOrderResult> {
            Ok(MarketOrderResult {
                order_id: 1,
                symbol: symbol.to_string(),
                side,
                executed_qty: quantity,
                avg_price: dec!(1010),
                quote_qty: dec!(1010) * quantity,
                fills: Vec::<Fill>::new(),
            })
        }
        async fn cancel_order(&self, _symbol: &str, _order_id: u64) -> Result<()> {
            Ok(())
        }
        async fn get_order_status(&self, _s: &str, _o: u64) -> Result<OrderStatus> {
            Ok(OrderStatus::Filled)
        }
        async fn get_klines(&self, _s: &str, _i: &str, _l: u16) -> Result<Vec<Kline>> {
            Ok(Vec::new())
        }
    }

    fn waiting_position(id: &str) -> Position {
        Position {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: dec!(1),
            entry_price: dec!(1000),
            trade_amount_usd: dec!(1000),
            entry_time: 1_700_000_000,
            current_price: dec!(1000),
            current_profit_usd: Decimal::ZERO,
            max_profit_usd: Decimal::ZERO,
            target_profit_usd: dec!(50),
            trailing_threshold_usd: dec!(10),
            stop_loss_price: dec!(975),
            stop_loss_reason: StopLossReason::ProfitRatioBased,
            bnb_sufficient: true,
            estimated_commission_usd: dec!(2),
            phase: Phase::WaitingProfit,
            last_update: 1_700_000_000,
            owner_process_id: None,
        }
    }

    async fn make_worker(
        store: &Arc<SharedStateStore>,
        id: &str,
    ) -> PositionWorker {
        let position = waiting_position(id);
        store.add_position(position.clone()).await.unwrap();
        PositionWorker::new(
            &position,
            Arc::clone(store),
            Arc::new(FixedPriceExchange(dec!(1010))),
            Arc::new(LogNotifier),
        )
    }

    #[tokio::test]
    async fn test_duplicate_worker_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        let supervisor = Supervisor::new();

        let worker = make_worker(&store, "pos-1").await;
        supervisor.start_worker(worker).await.unwrap();

        let position = store.get_position("pos-1").await.unwrap();
        let duplicate = PositionWorker::new(
            &position,
            Arc::clone(&store),
            Arc::new(FixedPriceExchange(dec!(1010))),
            Arc::new(LogNotifier),
        );
        assert!(supervisor.start_worker(duplicate).await.is_err());

        supervisor.shutdown_all(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn test_stop_worker_and_status() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        let supervisor = Supervisor::new();

        let worker = make_worker(&store, "pos-1").await;
        supervisor.start_worker(worker).await.unwrap();
        assert_eq!(supervisor.status().await.len(), 1);

        assert!(supervisor.stop_worker("pos-1", Duration::from_secs(5)).await);
        assert!(!supervisor.stop_worker("pos-1", Duration::from_secs(1)).await);
        assert_eq!(supervisor.status().await.len(), 0);
    }

    #[tokio::test]
    async fn test_stop_worker_aborts_worker_stuck_in_exchange_call() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        let supervisor = Supervisor::new();

        let position = waiting_position("pos-1");
        store.add_position(position.clone()).await.unwrap();
        let worker = PositionWorker::new(
            &position,
            Arc::clone(&store),
            Arc::new(SlowExchange),
            Arc::new(LogNotifier),
        );
        supervisor.start_worker(worker).await.unwrap();

        // Let the worker enter the hanging price call, then stop it with a
        // grace period far shorter than the call.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(supervisor.stop_worker("pos-1", Duration::from_millis(100)).await);

        // An aborted worker never finishes that call, so nothing may land in
        // the shared price cache after the stop returned.
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(store.get_market("BTCUSDT").await.is_none());
        assert!(!supervisor.is_running("pos-1").await);
    }

    #[tokio::test]
    async fn test_shutdown_all_stops_every_worker() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        let supervisor = Supervisor::new();

        for id in ["pos-1", "pos-2", "pos-3"] {
            let worker = make_worker(&store, id).await;
            supervisor.start_worker(worker).await.unwrap();
        }
        assert_eq!(supervisor.status().await.len(), 3);

        supervisor.shutdown_all(Duration::from_secs(5)).await;
        assert_eq!(supervisor.status().await.len(), 0);
        assert!(supervisor.status().await.is_empty());
    }
}
