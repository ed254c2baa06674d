//! Position state machine: turns a price sample into a phase transition and,
//! optionally, an exit instruction.
//!
//! Pure logic over a position record; the caller owns order execution and
//! persistence. Stop-loss is evaluated first on every tick, regardless of
//! phase, and overrides all phase-specific logic.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{Phase, Position};
use crate::state::SharedStateStore;

/// Why a position is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    StopLoss,
    TrailingStop,
    ProfitProtection,
    EmergencyExit,
    /// Operator-initiated close, not a risk event.
    Manual,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::ProfitProtection => "profit_protection",
            ExitReason::EmergencyExit => "emergency_exit",
            ExitReason::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Outcome of feeding one price sample into the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep the position open; updated fields should be persisted.
    Continue,
    /// Close the position. The phase has been moved to `Exiting`.
    Exit(ExitReason),
}

/// Per-position phase transitions and exit decisions.
pub struct PositionStateMachine;

impl PositionStateMachine {
    /// Apply a price sample to the position, mutating its live-tracking
    /// fields in place.
    ///
    /// Priority order: stop-loss always first; then, in the trailing phase,
    /// trailing-stop before profit-protection when both hold.
    pub fn update(position: &mut Position, current_price: Decimal) -> TickOutcome {
        position.current_price = current_price;
        let current_profit = position.profit_at(current_price);
        position.current_profit_usd = current_profit;

        if current_price <= position.stop_loss_price {
            info!(
                position_id = %position.id,
                price = %current_price,
                stop = %position.stop_loss_price,
                "stop loss triggered"
            );
            position.phase = Phase::Exiting;
            return TickOutcome::Exit(ExitReason::StopLoss);
        }

        match position.phase {
            Phase::WaitingProfit => {
                if current_profit >= position.target_profit_usd {
                    position.phase = Phase::Trailing;
                    position.max_profit_usd = current_profit;
                    info!(
                        position_id = %position.id,
                        profit = %current_profit,
                        "target profit reached, trailing activated"
                    );
                }
                TickOutcome::Continue
            }
            Phase::Trailing => {
                if current_profit > position.max_profit_usd {
                    position.max_profit_usd = current_profit;
                    debug!(position_id = %position.id, max_profit = %current_profit, "new peak profit");
                }

                let trailing_exit_level =
                    position.max_profit_usd - position.trailing_threshold_usd;
                let minimum_acceptable_profit = position.target_profit_usd
                    - position.trailing_threshold_usd * dec!(0.5);

                let reason = if current_profit <= trailing_exit_level {
                    Some(ExitReason::TrailingStop)
                } else if current_profit <= minimum_acceptable_profit {
                    Some(ExitReason::ProfitProtection)
                } else {
                    None
                };

                match reason {
                    Some(reason) => {
                        info!(
                            position_id = %position.id,
                            profit = %current_profit,
                            max_profit = %position.max_profit_usd,
                            threshold = %position.trailing_threshold_usd,
                            %reason,
                            "trailing exit triggered"
                        );
                        position.phase = Phase::Exiting;
                        TickOutcome::Exit(reason)
                    }
                    None => TickOutcome::Continue,
                }
            }
            // Entering/Exiting/Completed: nothing phase-specific to do here.
            _ => TickOutcome::Continue,
        }
    }

    /// Finalize a position after the closing order filled: mark it completed
    /// and delete it from the active set. Completed positions never remain in
    /// the store.
    pub async fn complete(
        store: &SharedStateStore,
        id: &str,
        exit_price: Decimal,
        realized_profit_usd: Decimal,
    ) -> anyhow::Result<()> {
        store
            .update_position(id, |p| {
                p.phase = Phase::Completed;
                p.current_price = exit_price;
                p.current_profit_usd = realized_profit_usd;
            })
            .await;
        store.remove_position(id).await?;

        info!(
            position_id = %id,
            exit_price = %exit_price,
            profit = %realized_profit_usd,
            "position completed"
        );
        Ok(())
    }
}

/// Monitoring view of one position, shaped by its current phase.
#[derive(Debug, Clone)]
pub struct PositionSummary {
    pub id: String,
    pub symbol: String,
    pub phase: Phase,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub current_profit_usd: Decimal,
    pub target_profit_usd: Decimal,
    /// Percent of the target reached; only meaningful while waiting.
    pub progress_to_target_pct: Option<Decimal>,
    /// Distance between peak and current profit while trailing.
    pub trailing_buffer_usd: Option<Decimal>,
    pub age_minutes: i64,
}

impl PositionSummary {
    pub fn of(position: &Position) -> Self {
        let progress_to_target_pct = (position.phase == Phase::WaitingProfit
            && !position.target_profit_usd.is_zero())
        .then(|| position.current_profit_usd / position.target_profit_usd * dec!(100));
        let trailing_buffer_usd = (position.phase == Phase::Trailing)
            .then(|| position.max_profit_usd - position.current_profit_usd);

        Self {
            id: position.id.clone(),
            symbol: position.symbol.clone(),
            phase: position.phase,
            entry_price: position.entry_price,
            current_price: position.current_price,
            current_profit_usd: position.current_profit_usd,
            target_profit_usd: position.target_profit_usd,
            progress_to_target_pct,
            trailing_buffer_usd,
            age_minutes: position.age_minutes(),
        }
    }
}
