// =============================================================================
// Position Sizing — risk budget scaling and the confidence gate
// =============================================================================
//
// `RiskEngine::size_trade` turns capital into a scaled risk budget and a
// per-lot stop distance, then hands both to `size_position`, which is pure:
//
//   budget = capital × risk_per_trade_pct
//          × regime.risk_per_trade × risk-state × day-type
//          × vol scale × loss-streak penalty × caller override
//
//   stop   = |entry − stop| × (1 + slippage_bps / 10 000) × lot_size
//
//   qty    = clamp(floor(budget × confidence_mult / stop), min_qty, max_qty)
//
// Every zero-size outcome carries a `SIZING_BLOCK:<reason>` so the caller can
// tell low confidence apart from a bad stop or an unaffordable minimum.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::risk::RiskEngine;
use crate::runtime_config::SizingPolicy;
use crate::trade::TradeCandidate;

/// Why sizing produced no quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SizingBlock {
    InvalidCapital,
    InvalidStopDistance,
    BudgetTooSmall,
    LowConfidence,
}

impl SizingBlock {
    pub fn reason(self) -> &'static str {
        match self {
            Self::InvalidCapital => "invalid_capital",
            Self::InvalidStopDistance => "invalid_stop_distance",
            Self::BudgetTooSmall => "budget_too_small",
            Self::LowConfidence => "low_confidence",
        }
    }
}

impl std::fmt::Display for SizingBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SIZING_BLOCK:{}", self.reason())
    }
}

/// Every factor that went into a sizing decision, kept for the audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingBreakdown {
    pub base_budget: f64,
    pub regime_mult: f64,
    pub risk_state_mult: f64,
    pub day_type_mult: f64,
    pub vol_scale: f64,
    pub streak_mult: f64,
    pub override_mult: f64,
    pub budget: f64,
    pub stop_distance: f64,
    pub confidence_mult: f64,
}

impl Default for SizingBreakdown {
    fn default() -> Self {
        Self {
            base_budget: 0.0,
            regime_mult: 1.0,
            risk_state_mult: 1.0,
            day_type_mult: 1.0,
            vol_scale: 1.0,
            streak_mult: 1.0,
            override_mult: 1.0,
            budget: 0.0,
            stop_distance: 0.0,
            confidence_mult: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizingOutcome {
    /// Lots to trade; zero whenever `block` is set.
    pub quantity: u32,
    pub block: Option<SizingBlock>,
    pub breakdown: SizingBreakdown,
}

impl SizingOutcome {
    fn blocked(block: SizingBlock, breakdown: SizingBreakdown) -> Self {
        Self {
            quantity: 0,
            block: Some(block),
            breakdown,
        }
    }

    pub fn is_blocked(&self) -> bool {
        self.block.is_some()
    }

    /// `SIZING_BLOCK:<reason>` or `OK`.
    pub fn code(&self) -> String {
        match self.block {
            Some(b) => b.to_string(),
            None => "OK".to_string(),
        }
    }
}

/// Linear factor clamped to `[0, 1]`; a degenerate band acts as a step.
fn interpolate(value: f64, min: f64, full: f64) -> f64 {
    if full <= min {
        return if value >= full { 1.0 } else { 0.0 };
    }
    ((value - min) / (full - min)).clamp(0.0, 1.0)
}

/// Confidence multiplier, or `None` when the gate rejects the trade.
///
/// Both scores must be present and at or above their minimums. At or above
/// both full-size thresholds the multiplier is 1.0; in between it is the mean
/// of the two interpolated factors.
pub fn confidence_multiplier(
    model_proba: Option<f64>,
    confluence: Option<f64>,
    policy: &SizingPolicy,
) -> Option<f64> {
    let proba = model_proba.filter(|p| p.is_finite())?;
    let conf = confluence.filter(|c| c.is_finite())?;

    if proba < policy.ml_min_proba || conf < policy.confidence_min {
        return None;
    }
    if proba >= policy.ml_full_size_proba && conf >= policy.confidence_full {
        return Some(1.0);
    }

    let p = interpolate(proba, policy.ml_min_proba, policy.ml_full_size_proba);
    let c = interpolate(conf, policy.confidence_min, policy.confidence_full);
    Some((p + c) / 2.0)
}

/// Pure sizing step: confidence gate, floor, clamp.
pub fn size_position(
    budget: f64,
    stop_distance: f64,
    model_proba: Option<f64>,
    confluence: Option<f64>,
    policy: &SizingPolicy,
) -> SizingOutcome {
    let mut breakdown = SizingBreakdown {
        base_budget: budget,
        budget,
        stop_distance,
        ..SizingBreakdown::default()
    };

    if !budget.is_finite() || budget < 0.0 {
        return SizingOutcome::blocked(SizingBlock::InvalidCapital, breakdown);
    }
    if !stop_distance.is_finite() || stop_distance <= 0.0 {
        return SizingOutcome::blocked(SizingBlock::InvalidStopDistance, breakdown);
    }

    let Some(mult) = confidence_multiplier(model_proba, confluence, policy) else {
        return SizingOutcome::blocked(SizingBlock::LowConfidence, breakdown);
    };
    breakdown.confidence_mult = mult;

    let raw = (budget * mult / stop_distance).floor();
    if !raw.is_finite() || raw < f64::from(policy.min_qty.max(1)) {
        return SizingOutcome::blocked(SizingBlock::BudgetTooSmall, breakdown);
    }

    let quantity = raw.min(f64::from(policy.max_qty)) as u32;
    SizingOutcome {
        quantity,
        block: None,
        breakdown,
    }
}

impl RiskEngine {
    /// Size a trade that has already passed `allow_trade`.
    ///
    /// `vol_target` overrides the configured target for this call.
    pub fn size_trade(
        &self,
        trade: &TradeCandidate,
        capital: f64,
        lot_size: f64,
        current_vol: Option<f64>,
        loss_streak: u32,
        vol_target: Option<f64>,
    ) -> SizingOutcome {
        let policy = &self.config.sizing;
        let mut breakdown = SizingBreakdown::default();

        if !capital.is_finite() || capital <= 0.0 {
            warn!(capital, strategy_id = %trade.strategy_id, "sizing blocked: invalid capital");
            return SizingOutcome::blocked(SizingBlock::InvalidCapital, breakdown);
        }

        let stop_distance = match (trade.entry_price, trade.stop_price) {
            (Some(entry), Some(stop)) if lot_size.is_finite() && lot_size > 0.0 => {
                (entry - stop).abs() * (1.0 + policy.max_slippage_bps_assumed / 10_000.0) * lot_size
            }
            _ => f64::NAN,
        };

        let state = self.state.snapshot();
        breakdown.base_budget = capital * policy.risk_per_trade_pct;
        breakdown.regime_mult = self.config.regimes.for_regime(trade.regime).risk_per_trade;
        breakdown.risk_state_mult = policy.risk_mode_mult(state.mode) * state.budget_multiplier;
        breakdown.day_type_mult = policy.day_type_mult(trade.day_type);
        breakdown.vol_scale = vol_scale(current_vol, vol_target.or(policy.vol_target), policy);
        breakdown.streak_mult = if policy.loss_streak_cap > 0 && loss_streak >= policy.loss_streak_cap {
            policy.loss_streak_penalty
        } else {
            1.0
        };
        breakdown.override_mult = trade
            .size_multiplier
            .filter(|m| m.is_finite() && *m >= 0.0)
            .unwrap_or(1.0);

        let budget = breakdown.base_budget
            * breakdown.regime_mult
            * breakdown.risk_state_mult
            * breakdown.day_type_mult
            * breakdown.vol_scale
            * breakdown.streak_mult
            * breakdown.override_mult;

        let mut outcome = size_position(
            budget,
            stop_distance,
            trade.model_proba,
            trade.confluence_score,
            policy,
        );
        breakdown.budget = budget;
        breakdown.stop_distance = stop_distance;
        breakdown.confidence_mult = outcome.breakdown.confidence_mult;
        outcome.breakdown = breakdown;

        match outcome.block {
            Some(block) => warn!(
                strategy_id = %trade.strategy_id,
                instrument_id = %trade.instrument_id,
                budget,
                stop_distance,
                code = %block,
                "sizing blocked"
            ),
            None => debug!(
                strategy_id = %trade.strategy_id,
                instrument_id = %trade.instrument_id,
                budget,
                stop_distance,
                quantity = outcome.quantity,
                "trade sized"
            ),
        }
        outcome
    }
}

/// `vol_target / current_vol` clamped to the configured band; 1.0 when
/// either side is unknown.
fn vol_scale(current_vol: Option<f64>, target: Option<f64>, policy: &SizingPolicy) -> f64 {
    match (current_vol, target) {
        (Some(v), Some(t)) if v.is_finite() && v > 0.0 && t.is_finite() && t > 0.0 => {
            (t / v).clamp(policy.vol_scale_min, policy.vol_scale_max)
        }
        _ => 1.0,
    }
}
