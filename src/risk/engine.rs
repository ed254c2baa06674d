//! Risk engine: commissions, stop-loss, position sizing and trade viability.
//!
//! Stateless; every function is a pure transform of inputs to outputs and is
//! safe to call concurrently from any task. Expected edge cases come back as
//! explicit [`ViabilityRejection`] values, never as panics.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use thiserror::Error;

use crate::models::StopLossReason;

/// Commission breakdown for a round trip (entry + exit).
#[derive(Debug, Clone)]
pub struct CommissionBreakdown {
    pub entry_usd: Decimal,
    pub exit_usd: Decimal,
    pub total_usd: Decimal,
    /// Equivalent amounts in the fee-discount asset; zero when no discount applies.
    pub entry_fee_asset: Decimal,
    pub exit_fee_asset: Decimal,
    pub total_fee_asset: Decimal,
    pub has_discount: bool,
    pub rate_used: Decimal,
}

/// How much of the fee-discount asset a trade needs.
#[derive(Debug, Clone)]
pub struct BnbRequirement {
    pub required: Decimal,
    pub required_with_safety: Decimal,
    pub current_balance: Decimal,
    pub is_sufficient: bool,
    pub fee_asset_price_usd: Decimal,
    pub safety_multiplier: Decimal,
}

/// Stop-loss derivation: max(total commission, 50% of the target profit).
#[derive(Debug, Clone)]
pub struct StopLossCalculation {
    pub stop_loss_price: Decimal,
    pub stop_loss_amount_usd: Decimal,
    pub reason: StopLossReason,
    pub commission_amount: Decimal,
    pub profit_ratio_amount: Decimal,
}

/// Trailing-stop thresholds derived from the target profit.
#[derive(Debug, Clone)]
pub struct TrailingThresholds {
    pub target_profit_usd: Decimal,
    /// Trailing activates once profit reaches the target.
    pub activation_usd: Decimal,
    /// Retrace from peak profit that triggers an exit.
    pub trailing_amount_usd: Decimal,
    pub trailing_percent: Decimal,
    /// Never sell below this profit once trailing is active.
    pub minimum_exit_profit_usd: Decimal,
}

/// Composite pre-trade assessment. Derived, never persisted.
#[derive(Debug, Clone)]
pub struct RiskAssessment {
    pub commissions: CommissionBreakdown,
    pub bnb: BnbRequirement,
    pub stop_loss: StopLossCalculation,
    pub trailing: TrailingThresholds,
    pub risk_reward_ratio: Decimal,
}

/// Why a candidate trade was rejected.
#[derive(Debug, Clone, Error)]
pub enum ViabilityRejection {
    #[error("trade amount too small: {amount} < {minimum}")]
    AmountTooSmall { amount: Decimal, minimum: Decimal },

    #[error("insufficient BNB: need {required}, have {available}")]
    InsufficientFeeAsset {
        required: Decimal,
        available: Decimal,
    },

    #[error("stop loss too large: {percent}% of entry price")]
    StopLossTooWide { percent: Decimal },

    #[error("poor risk/reward ratio: {ratio} (minimum {minimum})")]
    PoorRiskReward { ratio: Decimal, minimum: Decimal },
}

/// Recommended position size and the assessment that justified it.
#[derive(Debug, Clone)]
pub struct PositionSize {
    pub trade_amount_usd: Decimal,
    pub quantity: Decimal,
    pub risk_amount_usd: Decimal,
    pub risk_percent_of_balance: Decimal,
    pub assessment: RiskAssessment,
}

/// Pure risk computation over trade candidates.
#[derive(Debug, Clone)]
pub struct RiskEngine {
    /// Standard taker fee (0.1%).
    pub standard_rate: Decimal,
    /// Discounted fee when paying in BNB (0.075%).
    pub discount_rate: Decimal,
    /// Minimum BNB balance for the discount to apply.
    pub discount_min_balance: Decimal,
    /// Stop-loss floor as a fraction of the target profit.
    pub stop_loss_profit_ratio: Decimal,
    /// Safety multiplier on the raw BNB requirement.
    pub bnb_safety_multiplier: Decimal,
    /// Trailing retrace as a percent of the target profit.
    pub trailing_percent: Decimal,
    /// Maximum stop-loss distance as a percent of the entry price.
    pub max_stop_loss_percent: Decimal,
    /// Minimum target-profit / stop-loss ratio.
    pub min_risk_reward: Decimal,
}

impl Default for RiskEngine {
    fn default() -> Self {
        Self {
            standard_rate: dec!(0.001),
            discount_rate: dec!(0.00075),
            discount_min_balance: dec!(0.001),
            stop_loss_profit_ratio: dec!(0.5),
            bnb_safety_multiplier: dec!(2.5),
            trailing_percent: dec!(20),
            max_stop_loss_percent: dec!(10),
            min_risk_reward: dec!(1.5),
        }
    }
}

impl RiskEngine {
    /// Round-trip commissions for a trade of `trade_amount_usd`.
    ///
    /// The discounted rate applies iff the fee-asset balance clears the
    /// minimum threshold; otherwise fee-asset amounts are zero.
    pub fn calculate_commissions(
        &self,
        trade_amount_usd: Decimal,
        fee_asset_balance: Decimal,
        fee_asset_price_usd: Decimal,
    ) -> CommissionBreakdown {
        let has_discount = fee_asset_balance > self.discount_min_balance;
        let rate = if has_discount {
            self.discount_rate
        } else {
            self.standard_rate
        };

        let entry_usd = trade_amount_usd * rate;
        // Exit commission approximated as equal to entry.
        let exit_usd = trade_amount_usd * rate;
        let total_usd = entry_usd + exit_usd;

        let (entry_fee_asset, exit_fee_asset, total_fee_asset) = if has_discount {
            (
                entry_usd / fee_asset_price_usd,
                exit_usd / fee_asset_price_usd,
                total_usd / fee_asset_price_usd,
            )
        } else {
            (Decimal::ZERO, Decimal::ZERO, Decimal::ZERO)
        };

        CommissionBreakdown {
            entry_usd,
            exit_usd,
            total_usd,
            entry_fee_asset,
            exit_fee_asset,
            total_fee_asset,
            has_discount,
            rate_used: rate,
        }
    }

    /// BNB needed to cover commissions, with the safety multiplier applied.
    pub fn calculate_bnb_requirement(
        &self,
        trade_amount_usd: Decimal,
        current_balance: Decimal,
        fee_asset_price_usd: Decimal,
    ) -> BnbRequirement {
        let commissions =
            self.calculate_commissions(trade_amount_usd, current_balance, fee_asset_price_usd);
        let required = commissions.total_fee_asset;
        let required_with_safety = required * self.bnb_safety_multiplier;

        BnbRequirement {
            required,
            required_with_safety,
            current_balance,
            is_sufficient: current_balance >= required_with_safety,
            fee_asset_price_usd,
            safety_multiplier: self.bnb_safety_multiplier,
        }
    }

    /// Stop-loss amount is max(total commission, 50% of target profit).
    /// Ties resolve to commission-based.
    pub fn calculate_stop_loss(
        &self,
        entry_price: Decimal,
        target_profit_usd: Decimal,
        trade_amount_usd: Decimal,
        fee_asset_balance: Decimal,
        fee_asset_price_usd: Decimal,
    ) -> StopLossCalculation {
        let commissions =
            self.calculate_commissions(trade_amount_usd, fee_asset_balance, fee_asset_price_usd);
        let commission_amount = commissions.total_usd;
        let profit_ratio_amount = target_profit_usd * self.stop_loss_profit_ratio;

        let stop_loss_amount_usd = commission_amount.max(profit_ratio_amount);
        let reason = if stop_loss_amount_usd == commission_amount {
            StopLossReason::CommissionBased
        } else {
            StopLossReason::ProfitRatioBased
        };

        // For a long position: entry price minus the loss per base unit.
        let quantity = trade_amount_usd / entry_price;
        let stop_loss_per_unit = stop_loss_amount_usd / quantity;
        let stop_loss_price = entry_price - stop_loss_per_unit;

        StopLossCalculation {
            stop_loss_price,
            stop_loss_amount_usd,
            reason,
            commission_amount,
            profit_ratio_amount,
        }
    }

    /// Trailing activation, retrace amount and minimum acceptable exit profit.
    pub fn calculate_trailing_thresholds(
        &self,
        target_profit_usd: Decimal,
        trailing_percent: Decimal,
    ) -> TrailingThresholds {
        let trailing_amount_usd = target_profit_usd * trailing_percent / dec!(100);

        TrailingThresholds {
            target_profit_usd,
            activation_usd: target_profit_usd,
            trailing_amount_usd,
            trailing_percent,
            minimum_exit_profit_usd: target_profit_usd - trailing_amount_usd,
        }
    }

    /// Pre-trade gate: fee coverage, bounded stop-loss distance and minimum
    /// risk/reward ratio. Returns the composite assessment on success.
    pub fn check_viability(
        &self,
        trade_amount_usd: Decimal,
        target_profit_usd: Decimal,
        entry_price: Decimal,
        fee_asset_balance: Decimal,
        fee_asset_price_usd: Decimal,
        min_trade_amount: Decimal,
    ) -> Result<RiskAssessment, ViabilityRejection> {
        if trade_amount_usd < min_trade_amount {
            return Err(ViabilityRejection::AmountTooSmall {
                amount: trade_amount_usd,
                minimum: min_trade_amount,
            });
        }

        let commissions =
            self.calculate_commissions(trade_amount_usd, fee_asset_balance, fee_asset_price_usd);

        let bnb = self.calculate_bnb_requirement(
            trade_amount_usd,
            fee_asset_balance,
            fee_asset_price_usd,
        );
        if !bnb.is_sufficient {
            return Err(ViabilityRejection::InsufficientFeeAsset {
                required: bnb.required_with_safety,
                available: fee_asset_balance,
            });
        }

        let stop_loss = self.calculate_stop_loss(
            entry_price,
            target_profit_usd,
            trade_amount_usd,
            fee_asset_balance,
            fee_asset_price_usd,
        );

        let stop_loss_percent =
            (entry_price - stop_loss.stop_loss_price) / entry_price * dec!(100);
        if stop_loss_percent > self.max_stop_loss_percent {
            return Err(ViabilityRejection::StopLossTooWide {
                percent: stop_loss_percent.round_dp(2),
            });
        }

        let trailing =
            self.calculate_trailing_thresholds(target_profit_usd, self.trailing_percent);

        let risk_reward_ratio = target_profit_usd / stop_loss.stop_loss_amount_usd;
        if risk_reward_ratio < self.min_risk_reward {
            return Err(ViabilityRejection::PoorRiskReward {
                ratio: risk_reward_ratio.round_dp(2),
                minimum: self.min_risk_reward,
            });
        }

        Ok(RiskAssessment {
            commissions,
            bnb,
            stop_loss,
            trailing,
            risk_reward_ratio,
        })
    }

    /// Scan a fixed multiplier ladder over the risk budget and return the
    /// first candidate that is viable and keeps the stop-loss amount within
    /// the budget. `None` when no candidate qualifies.
    pub fn calculate_position_size(
        &self,
        available_balance: Decimal,
        entry_price: Decimal,
        target_profit_usd: Decimal,
        risk_percent: Decimal,
        fee_asset_balance: Decimal,
        fee_asset_price_usd: Decimal,
    ) -> Option<PositionSize> {
        const MULTIPLIERS: [Decimal; 6] = [
            dec!(0.5),
            dec!(1.0),
            dec!(1.5),
            dec!(2.0),
            dec!(2.5),
            dec!(3.0),
        ];

        let max_risk_amount = available_balance * risk_percent / dec!(100);
        let balance_cap = available_balance * dec!(0.1);

        for multiplier in MULTIPLIERS {
            let candidate = max_risk_amount * multiplier;
            if candidate > balance_cap {
                continue;
            }

            let assessment = match self.check_viability(
                candidate,
                target_profit_usd,
                entry_price,
                fee_asset_balance,
                fee_asset_price_usd,
                dec!(10),
            ) {
                Ok(a) => a,
                Err(_) => continue,
            };

            if assessment.stop_loss.stop_loss_amount_usd <= max_risk_amount {
                return Some(PositionSize {
                    trade_amount_usd: candidate,
                    quantity: candidate / entry_price,
                    risk_amount_usd: assessment.stop_loss.stop_loss_amount_usd,
                    risk_percent_of_balance: assessment.stop_loss.stop_loss_amount_usd
                        / available_balance
                        * dec!(100),
                    assessment,
                });
            }
        }

        None
    }

    /// Human-readable risk report logged at position creation.
    pub fn format_risk_report(
        &self,
        trade_amount_usd: Decimal,
        entry_price: Decimal,
        assessment: &RiskAssessment,
    ) -> String {
        let c = &assessment.commissions;
        let s = &assessment.stop_loss;
        let b = &assessment.bnb;
        let t = &assessment.trailing;

        format!(
            "\nRISK ANALYSIS\n=============\n\
             Trade Amount: ${:.2}\n\
             Entry Price: ${:.2}\n\
             Target Profit: ${:.2}\n\
             Commissions: entry ${:.4} + exit ${:.4} = ${:.4} ({}%) | BNB discount: {}\n\
             Commission in BNB: entry {:.6} + exit {:.6} = {:.6}\n\
             Stop Loss: ${:.2} (amount ${:.2}, {:?}; commission ${:.2} vs profit term ${:.2})\n\
             BNB: need {:.6} x{} safety = {:.6} @ ${:.2}, balance {:.6}, sufficient: {}\n\
             Trailing: activates at ${:.2}, retrace ${:.2} ({}%), minimum exit ${:.2}\n\
             Risk/Reward: 1:{:.2}",
            trade_amount_usd,
            entry_price,
            t.target_profit_usd,
            c.entry_usd,
            c.exit_usd,
            c.total_usd,
            c.rate_used * dec!(100),
            c.has_discount,
            c.entry_fee_asset,
            c.exit_fee_asset,
            c.total_fee_asset,
            s.stop_loss_price,
            s.stop_loss_amount_usd,
            s.reason,
            s.commission_amount,
            s.profit_ratio_amount,
            b.required,
            b.safety_multiplier,
            b.required_with_safety,
            b.fee_asset_price_usd,
            b.current_balance,
            b.is_sufficient,
            t.activation_usd,
            t.trailing_amount_usd,
            t.trailing_percent,
            t.minimum_exit_profit_usd,
            assessment.risk_reward_ratio,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RiskEngine {
        RiskEngine::default()
    }

    #[test]
    fn test_commission_rate_selection() {
        // Above the 0.001 BNB threshold the discounted rate applies.
        let c = engine().calculate_commissions(dec!(1000), dec!(0.5), dec!(300));
        assert_eq!(c.rate_used, dec!(0.00075));
        assert!(c.has_discount);
        assert_eq!(c.total_usd, dec!(1.5));
        assert_eq!(c.total_fee_asset, dec!(1.5) / dec!(300));

        // At or below the threshold the standard rate applies, no fee-asset amounts.
        let c = engine().calculate_commissions(dec!(1000), dec!(0.001), dec!(300));
        assert_eq!(c.rate_used, dec!(0.001));
        assert!(!c.has_discount);
        assert_eq!(c.total_usd, dec!(2));
        assert_eq!(c.total_fee_asset, Decimal::ZERO);
    }

    #[test]
    fn test_bnb_requirement_safety_multiplier() {
        let req = engine().calculate_bnb_requirement(dec!(1000), dec!(1), dec!(300));
        // 1.5 USD of commission at the discount rate, in BNB, times 2.5.
        assert_eq!(req.required, dec!(1.5) / dec!(300));
        assert_eq!(req.required_with_safety, dec!(1.5) / dec!(300) * dec!(2.5));
        assert!(req.is_sufficient);

        let req = engine().calculate_bnb_requirement(dec!(1000), dec!(0.002), dec!(300));
        assert!(!req.is_sufficient);
    }

    #[test]
    fn test_stop_loss_profit_ratio_based() {
        // entry=60000, target=50, amount=1000, no BNB:
        // commission = 1000 * 0.001 * 2 = 2; profit term = 25; max = 25.
        let s = engine().calculate_stop_loss(dec!(60000), dec!(50), dec!(1000), dec!(0), dec!(300));
        assert_eq!(s.commission_amount, dec!(2));
        assert_eq!(s.profit_ratio_amount, dec!(25));
        assert_eq!(s.stop_loss_amount_usd, dec!(25));
        assert_eq!(s.reason, StopLossReason::ProfitRatioBased);

        // quantity = 1000/60000, price = 60000 - 25/quantity = 58500.
        let diff = (s.stop_loss_price - dec!(58500)).abs();
        assert!(diff < dec!(0.0001), "stop loss price {}", s.stop_loss_price);
    }

    #[test]
    fn test_stop_loss_tie_resolves_to_commission() {
        // Pick target so that 0.5 * target exactly equals the commission term.
        // amount=1000, no BNB: commission = 2; target = 4 -> profit term = 2.
        let s = engine().calculate_stop_loss(dec!(60000), dec!(4), dec!(1000), dec!(0), dec!(300));
        assert_eq!(s.commission_amount, s.profit_ratio_amount);
        assert_eq!(s.reason, StopLossReason::CommissionBased);
    }

    #[test]
    fn test_trailing_thresholds() {
        let t = engine().calculate_trailing_thresholds(dec!(50), dec!(20));
        assert_eq!(t.trailing_amount_usd, dec!(10));
        assert_eq!(t.activation_usd, dec!(50));
        assert_eq!(t.minimum_exit_profit_usd, dec!(40));
    }

    #[test]
    fn test_viability_minimum_amount() {
        let err = engine()
            .check_viability(dec!(5), dec!(50), dec!(60000), dec!(1), dec!(300), dec!(10))
            .unwrap_err();
        assert!(matches!(err, ViabilityRejection::AmountTooSmall { .. }));
    }

    #[test]
    fn test_viability_insufficient_fee_asset() {
        let err = engine()
            .check_viability(
                dec!(1000),
                dec!(50),
                dec!(60000),
                dec!(0.002),
                dec!(300),
                dec!(10),
            )
            .unwrap_err();
        assert!(matches!(err, ViabilityRejection::InsufficientFeeAsset { .. }));
    }

    #[test]
    fn test_viability_rejects_poor_risk_reward() {
        // target=30 -> stop amount = 15, ratio = 2.0: passes.
        assert!(engine()
            .check_viability(dec!(1000), dec!(30), dec!(60000), dec!(1), dec!(300), dec!(10))
            .is_ok());

        // Commission-dominated stop: tiny target on a big trade.
        // amount=100000 with BNB: commission = 150; target=100 -> stop=150,
        // ratio = 0.67 < 1.5. Stop distance is small so only the ratio fails.
        let err = engine()
            .check_viability(
                dec!(100000),
                dec!(100),
                dec!(60000),
                dec!(10),
                dec!(300),
                dec!(10),
            )
            .unwrap_err();
        assert!(matches!(err, ViabilityRejection::PoorRiskReward { .. }));
    }

    #[test]
    fn test_viability_rejects_wide_stop_loss() {
        // Small trade, huge target: stop amount = 50% of target dwarfs the
        // position, pushing the stop far below entry.
        let err = engine()
            .check_viability(
                dec!(20),
                dec!(50),
                dec!(60000),
                dec!(1),
                dec!(300),
                dec!(10),
            )
            .unwrap_err();
        assert!(matches!(err, ViabilityRejection::StopLossTooWide { .. }));
    }

    #[test]
    fn test_position_size_picks_first_viable_multiplier() {
        // balance=10000, risk 2% -> budget 200; ladder candidates 100..600,
        // cap at 10% of balance = 1000. First viable candidate wins.
        let size = engine()
            .calculate_position_size(
                dec!(10000),
                dec!(60000),
                dec!(20),
                dec!(2),
                dec!(1),
                dec!(300),
            )
            .expect("sizing succeeds");

        assert_eq!(size.trade_amount_usd, dec!(100));
        assert!(size.risk_amount_usd <= dec!(200));
    }

    #[test]
    fn test_position_size_none_when_nothing_fits() {
        // Tiny balance: every ladder candidate lands below the $10 minimum
        // trade amount.
        let size = engine().calculate_position_size(
            dec!(100),
            dec!(60000),
            dec!(500),
            dec!(2),
            dec!(1),
            dec!(300),
        );
        assert!(size.is_none());
    }
}
