//! Pre-trade risk computation.

mod engine;

pub use engine::{
    BnbRequirement, CommissionBreakdown, PositionSize, RiskAssessment, RiskEngine,
    StopLossCalculation, TrailingThresholds, ViabilityRejection,
};
