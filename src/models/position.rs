//! Position model: one open long holding being managed toward a profit target.

use chrono::Utc;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::risk::RiskAssessment;

/// Order side. The strategy is long-only; `Sell` only appears on closing orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Buy,
    Sell,
}

/// Lifecycle phase of a position.
///
/// `Entering`, `Exiting` and `Completed` are transient bookends; the per-tick
/// logic operates over `WaitingProfit` and `Trailing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Entering,
    WaitingProfit,
    Trailing,
    Exiting,
    Completed,
}

/// Why the stop-loss amount came out the way it did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopLossReason {
    CommissionBased,
    ProfitRatioBased,
}

/// One active trade, persisted in the shared state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,

    /// Base-asset quantity bought at entry. Always > 0.
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub trade_amount_usd: Decimal,
    /// Epoch seconds at entry.
    pub entry_time: i64,

    pub current_price: Decimal,
    pub current_profit_usd: Decimal,
    /// Peak profit observed. Monotonically non-decreasing once trailing is active.
    pub max_profit_usd: Decimal,

    pub target_profit_usd: Decimal,
    /// Retrace from peak profit that triggers a trailing exit
    /// (target profit * trailing percent).
    pub trailing_threshold_usd: Decimal,

    /// Always below `entry_price`.
    pub stop_loss_price: Decimal,
    pub stop_loss_reason: StopLossReason,

    pub bnb_sufficient: bool,
    pub estimated_commission_usd: Decimal,

    pub phase: Phase,
    /// Epoch seconds of the last mutation.
    pub last_update: i64,
    /// Advisory marker: PID of the worker currently driving this position.
    #[serde(default)]
    pub owner_process_id: Option<u32>,
}

impl Position {
    /// Build a new position from a validated entry and its risk assessment.
    pub fn new(
        symbol: &str,
        entry_price: Decimal,
        quantity: Decimal,
        trade_amount_usd: Decimal,
        target_profit_usd: Decimal,
        assessment: &RiskAssessment,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::generate_id(),
            symbol: symbol.to_string(),
            side: Side::Buy,
            quantity,
            entry_price,
            trade_amount_usd,
            entry_time: now.timestamp(),
            current_price: entry_price,
            current_profit_usd: Decimal::ZERO,
            max_profit_usd: Decimal::ZERO,
            target_profit_usd,
            trailing_threshold_usd: assessment.trailing.trailing_amount_usd,
            stop_loss_price: assessment.stop_loss.stop_loss_price,
            stop_loss_reason: assessment.stop_loss.reason,
            bnb_sufficient: assessment.bnb.is_sufficient,
            estimated_commission_usd: assessment.commissions.total_usd,
            phase: Phase::Entering,
            last_update: now.timestamp(),
            owner_process_id: None,
        }
    }

    /// Timestamp-derived id with a random suffix so that positions opened
    /// within the same millisecond cannot collide.
    fn generate_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("pos-{}-{}", Utc::now().timestamp_millis(), &suffix[..6])
    }

    /// Unrealized profit at `price` in quote currency.
    pub fn profit_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity
    }

    /// Age of the position in minutes.
    pub fn age_minutes(&self) -> i64 {
        (Utc::now().timestamp() - self.entry_time) / 60
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::risk::RiskEngine;
    use rust_decimal_macros::dec;

    #[test]
    fn test_position_from_assessment() {
        let engine = RiskEngine::default();
        let assessment = engine
            .check_viability(dec!(1000), dec!(50), dec!(60000), dec!(1), dec!(300), dec!(10))
            .expect("viable");

        let pos = Position::new(
            "BTCUSDT",
            dec!(60000),
            dec!(1000) / dec!(60000),
            dec!(1000),
            dec!(50),
            &assessment,
        );

        assert!(pos.quantity > Decimal::ZERO);
        assert!(pos.stop_loss_price < pos.entry_price);
        assert_eq!(pos.phase, Phase::Entering);
        assert_eq!(pos.trailing_threshold_usd, dec!(10));
    }

    #[test]
    fn test_ids_unique_for_same_millisecond_opens() {
        let engine = RiskEngine::default();
        let assessment = engine
            .check_viability(dec!(1000), dec!(50), dec!(60000), dec!(1), dec!(300), dec!(10))
            .expect("viable");

        let ids: std::collections::HashSet<String> = (0..64)
            .map(|_| {
                Position::new(
                    "BTCUSDT",
                    dec!(60000),
                    dec!(0.01),
                    dec!(1000),
                    dec!(50),
                    &assessment,
                )
                .id
            })
            .collect();
        assert_eq!(ids.len(), 64);
    }

    #[test]
    fn test_profit_at() {
        let engine = RiskEngine::default();
        let assessment = engine
            .check_viability(dec!(1000), dec!(50), dec!(50000), dec!(1), dec!(300), dec!(10))
            .expect("viable");
        let pos = Position::new(
            "BTCUSDT",
            dec!(50000),
            dec!(0.02),
            dec!(1000),
            dec!(50),
            &assessment,
        );

        assert_eq!(pos.profit_at(dec!(52500)), dec!(50));
        assert!(pos.profit_at(dec!(49000)) < Decimal::ZERO);
    }
}
