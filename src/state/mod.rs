//! Process-shared state registry backed by a JSON file.
//!
//! Single source of truth for active positions, latest market prices and
//! balances. Structural mutations (add/remove position, bot-status change) are
//! flushed to disk synchronously before the call returns; routine field
//! updates ride the 10 s autosave. Every write follows the same sequence:
//! take the OS-level exclusive lock, copy the current file to a backup
//! sibling, serialize the full state, release the lock. Readers performing a
//! full reload take the same lock.
//!
//! Consistency model is single-writer-per-key: only the worker that owns a
//! position mutates its fields; only the bot creates and deletes entries.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use fs2::FileExt;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::models::{AssetBalance, MarketExtras, MarketSnapshot, Position};

const STATE_FILE: &str = "system_state.json";
const BACKUP_FILE: &str = "system_state.backup.json";
const LOCK_FILE: &str = ".state.lock";

/// Default autosave cadence.
pub const AUTOSAVE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Default)]
struct SystemState {
    active_positions: HashMap<String, Position>,
    market_data: HashMap<String, MarketSnapshot>,
    balance_data: HashMap<String, AssetBalance>,
    last_update: i64,
    bot_running: bool,
    stream_connected: bool,
}

/// On-disk representation. Field names are part of the state-file format.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedState<'a> {
    active_positions: &'a HashMap<String, Position>,
    market_data: &'a HashMap<String, MarketSnapshot>,
    balance_data: &'a HashMap<String, AssetBalance>,
    last_update: i64,
    bot_running: bool,
    stream_connected: bool,
    saved_at: String,
}

/// Snapshot of system-level counters for the status command.
#[derive(Debug, Clone)]
pub struct SystemInfo {
    pub active_positions: usize,
    pub bot_running: bool,
    pub stream_connected: bool,
    pub last_update: i64,
}

/// Durable, lock-protected registry shared by the bot and all workers.
pub struct SharedStateStore {
    state_path: PathBuf,
    backup_path: PathBuf,
    lock_path: PathBuf,
    inner: RwLock<SystemState>,
    autosave_running: AtomicBool,
    autosave_task: Mutex<Option<JoinHandle<()>>>,
}

impl SharedStateStore {
    /// Create a store rooted at `data_dir`, creating the directory if needed.
    /// Does not read the file; call [`load`](Self::load) to restore state.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let dir = data_dir.as_ref();
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create state dir {}", dir.display()))?;

        Ok(Self {
            state_path: dir.join(STATE_FILE),
            backup_path: dir.join(BACKUP_FILE),
            lock_path: dir.join(LOCK_FILE),
            inner: RwLock::new(SystemState::default()),
            autosave_running: AtomicBool::new(false),
            autosave_task: Mutex::new(None),
        })
    }

    fn acquire_lock(&self) -> Result<File> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.lock_path)
            .context("failed to open state lock file")?;
        file.lock_exclusive().context("failed to lock state file")?;
        Ok(file)
    }

    // -- positions --------------------------------------------------------

    /// Add a new position and flush immediately. Fails on a duplicate id.
    pub async fn add_position(&self, position: Position) -> Result<()> {
        let id = position.id.clone();
        {
            let mut state = self.inner.write().await;
            if state.active_positions.contains_key(&id) {
                bail!("position {id} already exists");
            }
            state.active_positions.insert(id.clone(), position);
            state.last_update = Utc::now().timestamp();
        }
        self.save(true).await?;
        info!(position_id = %id, "position added to state");
        Ok(())
    }

    /// Merge fields into an existing position and bump its `last_update`.
    /// A missing id is a logged no-op; returns whether the id was present.
    pub async fn update_position<F>(&self, id: &str, mutate: F) -> bool
    where
        F: FnOnce(&mut Position),
    {
        let mut state = self.inner.write().await;
        match state.active_positions.get_mut(id) {
            Some(position) => {
                mutate(position);
                position.last_update = Utc::now().timestamp();
                state.last_update = Utc::now().timestamp();
                true
            }
            None => {
                warn!(position_id = %id, "update for unknown position ignored");
                false
            }
        }
    }

    /// Delete a position and flush immediately. Returns whether it existed.
    pub async fn remove_position(&self, id: &str) -> Result<bool> {
        let removed = {
            let mut state = self.inner.write().await;
            let removed = state.active_positions.remove(id).is_some();
            if removed {
                state.last_update = Utc::now().timestamp();
            }
            removed
        };

        if removed {
            self.save(true).await?;
            info!(position_id = %id, "position removed from state");
        } else {
            warn!(position_id = %id, "remove for unknown position ignored");
        }
        Ok(removed)
    }

    /// Independent copy of one position.
    pub async fn get_position(&self, id: &str) -> Option<Position> {
        self.inner.read().await.active_positions.get(id).cloned()
    }

    /// Independent copies of all active positions.
    pub async fn list_positions(&self) -> Vec<Position> {
        self.inner
            .read()
            .await
            .active_positions
            .values()
            .cloned()
            .collect()
    }

    // -- market and balances ----------------------------------------------

    /// Overwrite the market snapshot for `symbol`.
    pub async fn update_market(&self, symbol: &str, price: Decimal, extras: MarketExtras) {
        let mut state = self.inner.write().await;
        state
            .market_data
            .insert(symbol.to_string(), MarketSnapshot::now(price, extras));
        state.last_update = Utc::now().timestamp();
    }

    /// Independent copy of the latest market snapshot for `symbol`.
    pub async fn get_market(&self, symbol: &str) -> Option<MarketSnapshot> {
        self.inner.read().await.market_data.get(symbol).cloned()
    }

    /// Merge the given balances into the balance snapshot.
    pub async fn update_balances(&self, balances: HashMap<String, AssetBalance>) {
        let mut state = self.inner.write().await;
        state.balance_data.extend(balances);
        state.last_update = Utc::now().timestamp();
    }

    /// Free balance for one asset, if known.
    pub async fn get_balance(&self, asset: &str) -> Option<AssetBalance> {
        self.inner.read().await.balance_data.get(asset).cloned()
    }

    // -- flags -------------------------------------------------------------

    /// Set the bot-running flag; flushed immediately.
    pub async fn set_bot_running(&self, running: bool) -> Result<()> {
        {
            let mut state = self.inner.write().await;
            state.bot_running = running;
            state.last_update = Utc::now().timestamp();
        }
        self.save(true).await
    }

    /// Set the stream-connected flag; rides the next periodic save.
    pub async fn set_stream_connected(&self, connected: bool) {
        let mut state = self.inner.write().await;
        state.stream_connected = connected;
        state.last_update = Utc::now().timestamp();
    }

    pub async fn system_info(&self) -> SystemInfo {
        let state = self.inner.read().await;
        SystemInfo {
            active_positions: state.active_positions.len(),
            bot_running: state.bot_running,
            stream_connected: state.stream_connected,
            last_update: state.last_update,
        }
    }

    // -- persistence -------------------------------------------------------

    /// Serialize the full state to disk: exclusive lock, backup copy of the
    /// previous file, write, unlock.
    ///
    /// `force` is advisory only; it marks an immediate flush at the call site
    /// but the write sequence is identical either way.
    pub async fn save(&self, force: bool) -> Result<()> {
        let json = {
            let state = self.inner.read().await;
            let persisted = PersistedState {
                active_positions: &state.active_positions,
                market_data: &state.market_data,
                balance_data: &state.balance_data,
                last_update: state.last_update,
                bot_running: state.bot_running,
                stream_connected: state.stream_connected,
                saved_at: Utc::now().to_rfc3339(),
            };
            serde_json::to_string_pretty(&persisted).context("failed to serialize state")?
        };

        let lock = self.acquire_lock()?;
        let result = (|| -> Result<()> {
            if self.state_path.exists() {
                fs::copy(&self.state_path, &self.backup_path)
                    .context("failed to write state backup")?;
            }
            fs::write(&self.state_path, json).context("failed to write state file")?;
            Ok(())
        })();
        let _ = lock.unlock();

        if result.is_ok() {
            debug!(force, "state saved");
        }
        result
    }

    /// Restore state from disk. Malformed individual position records are
    /// dropped with an error; a broken primary file falls back to the backup
    /// under the same per-record tolerance. The bot/stream flags always reset
    /// to false: a restarted process is never "already running".
    pub async fn load(&self) -> Result<()> {
        if !self.state_path.exists() {
            info!("no existing state file found, starting fresh");
            return Ok(());
        }

        let lock = self.acquire_lock()?;
        let primary = fs::read_to_string(&self.state_path)
            .context("failed to read state file")
            .and_then(|text| parse_state(&text));

        let loaded = match primary {
            Ok(loaded) => Some(loaded),
            Err(e) => {
                error!(error = %e, "failed to load state file, trying backup");
                match fs::read_to_string(&self.backup_path)
                    .context("failed to read backup state file")
                    .and_then(|text| parse_state(&text))
                {
                    Ok(loaded) => {
                        warn!("state restored from backup");
                        Some(loaded)
                    }
                    Err(backup_err) => {
                        error!(error = %backup_err, "failed to load backup state");
                        None
                    }
                }
            }
        };
        let _ = lock.unlock();

        let Some(loaded) = loaded else {
            bail!("unable to load state from primary or backup file");
        };

        let count = loaded.active_positions.len();
        let mut state = self.inner.write().await;
        state.active_positions = loaded.active_positions;
        state.market_data = loaded.market_data;
        state.balance_data = loaded.balance_data;
        state.last_update = loaded.last_update;
        state.bot_running = false;
        state.stream_connected = false;
        drop(state);

        info!(positions = count, "state loaded");
        Ok(())
    }

    // -- autosave ----------------------------------------------------------

    /// Start the background autosave task. Idempotent.
    pub async fn start_autosave(self: &std::sync::Arc<Self>, interval: Duration) {
        if self.autosave_running.swap(true, Ordering::SeqCst) {
            return;
        }

        let store = std::sync::Arc::clone(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                if !store.autosave_running.load(Ordering::SeqCst) {
                    break;
                }
                if let Err(e) = store.save(false).await {
                    error!(error = %e, "autosave failed");
                }
            }
        });

        *self.autosave_task.lock().await = Some(handle);
    }

    /// Stop the autosave task. In-memory state is untouched; callers are
    /// expected to issue a final forced save at shutdown.
    pub async fn stop_autosave(&self) {
        self.autosave_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.autosave_task.lock().await.take() {
            handle.abort();
        }
    }
}

struct LoadedState {
    active_positions: HashMap<String, Position>,
    market_data: HashMap<String, MarketSnapshot>,
    balance_data: HashMap<String, AssetBalance>,
    last_update: i64,
}

/// Parse a persisted state document with per-record tolerance: a position
/// that fails to deserialize is logged and dropped, the rest survive.
fn parse_state(text: &str) -> Result<LoadedState> {
    let doc: Value = serde_json::from_str(text).context("state file is not valid JSON")?;

    let mut active_positions = HashMap::new();
    if let Some(records) = doc.get("activePositions").and_then(Value::as_object) {
        for (id, record) in records {
            match serde_json::from_value::<Position>(record.clone()) {
                Ok(position) => {
                    active_positions.insert(id.clone(), position);
                }
                Err(e) => {
                    error!(position_id = %id, error = %e, "dropping malformed position record");
                }
            }
        }
    }

    let market_data = doc
        .get("marketData")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let balance_data = doc
        .get("balanceData")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok())
        .unwrap_or_default();
    let last_update = doc
        .get("lastUpdate")
        .and_then(Value::as_i64)
        .unwrap_or_else(|| Utc::now().timestamp());

    Ok(LoadedState {
        active_positions,
        market_data,
        balance_data,
        last_update,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Phase, Side, StopLossReason};
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    fn sample_position(id: &str) -> Position {
        Position {
            id: id.to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Buy,
            quantity: dec!(0.016),
            entry_price: dec!(60000),
            trade_amount_usd: dec!(1000),
            entry_time: 1_700_000_000,
            current_price: dec!(60000),
            current_profit_usd: Decimal::ZERO,
            max_profit_usd: Decimal::ZERO,
            target_profit_usd: dec!(50),
            trailing_threshold_usd: dec!(10),
            stop_loss_price: dec!(58500),
            stop_loss_reason: StopLossReason::ProfitRatioBased,
            bnb_sufficient: true,
            estimated_commission_usd: dec!(2),
            phase: Phase::WaitingProfit,
            last_update: 1_700_000_000,
            owner_process_id: None,
        }
    }

    #[tokio::test]
    async fn test_add_get_roundtrip_across_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStateStore::new(dir.path()).unwrap();

        store.add_position(sample_position("pos-1")).await.unwrap();
        store.set_bot_running(true).await.unwrap();
        store.set_stream_connected(true).await;
        store.save(true).await.unwrap();

        // Simulated process restart.
        let restored = SharedStateStore::new(dir.path()).unwrap();
        restored.load().await.unwrap();

        let position = restored.get_position("pos-1").await.expect("position survives");
        assert_eq!(position.symbol, "BTCUSDT");
        assert_eq!(position.stop_loss_price, dec!(58500));
        assert_eq!(position.phase, Phase::WaitingProfit);

        // Flags always reset on load.
        let info = restored.system_info().await;
        assert!(!info.bot_running);
        assert!(!info.stream_connected);
    }

    #[tokio::test]
    async fn test_duplicate_add_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStateStore::new(dir.path()).unwrap();

        store.add_position(sample_position("pos-1")).await.unwrap();
        assert!(store.add_position(sample_position("pos-1")).await.is_err());
    }

    #[tokio::test]
    async fn test_save_is_idempotent_modulo_saved_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStateStore::new(dir.path()).unwrap();
        store.add_position(sample_position("pos-1")).await.unwrap();

        store.save(true).await.unwrap();
        let first = fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        store.save(true).await.unwrap();
        let second = fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();

        let mut a: Value = serde_json::from_str(&first).unwrap();
        let mut b: Value = serde_json::from_str(&second).unwrap();
        a.as_object_mut().unwrap().remove("savedAt");
        b.as_object_mut().unwrap().remove("savedAt");
        assert_eq!(a, b);
    }

    #[tokio::test]
    async fn test_backup_recovery_drops_malformed_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStateStore::new(dir.path()).unwrap();
        store.add_position(sample_position("pos-good")).await.unwrap();

        // Craft a backup holding one well-formed and one malformed record.
        let primary = fs::read_to_string(dir.path().join(STATE_FILE)).unwrap();
        let mut doc: Value = serde_json::from_str(&primary).unwrap();
        doc["activePositions"]["pos-bad"] = serde_json::json!({ "id": "pos-bad" });
        fs::write(
            dir.path().join(BACKUP_FILE),
            serde_json::to_string(&doc).unwrap(),
        )
        .unwrap();

        // Corrupt the primary file.
        fs::write(dir.path().join(STATE_FILE), "{ not json").unwrap();

        let restored = SharedStateStore::new(dir.path()).unwrap();
        restored.load().await.unwrap();

        let positions = restored.list_positions().await;
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].id, "pos-good");
    }

    #[tokio::test]
    async fn test_removed_position_stays_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStateStore::new(dir.path()).unwrap();
        store.add_position(sample_position("pos-1")).await.unwrap();

        let updated = store
            .update_position("pos-1", |p| p.current_profit_usd = dec!(12))
            .await;
        assert!(updated);

        assert!(store.remove_position("pos-1").await.unwrap());
        assert!(store.get_position("pos-1").await.is_none());

        // Also gone after reload.
        let restored = SharedStateStore::new(dir.path()).unwrap();
        restored.load().await.unwrap();
        assert!(restored.get_position("pos-1").await.is_none());
    }

    #[tokio::test]
    async fn test_update_unknown_position_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = SharedStateStore::new(dir.path()).unwrap();
        assert!(!store.update_position("missing", |_| {}).await);
    }

    #[tokio::test]
    async fn test_autosave_start_stop() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SharedStateStore::new(dir.path()).unwrap());
        store.add_position(sample_position("pos-1")).await.unwrap();

        store.start_autosave(Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        store.stop_autosave().await;

        assert!(dir.path().join(STATE_FILE).exists());
    }
}
