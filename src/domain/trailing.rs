//! Break-even arming and staircase trailing policy.
//!
//! `next_stop` is a pure function from position state and current ROI to the
//! next protective stop. It never proposes a stop that moves against the
//! trader: when a computed candidate would violate stop monotonicity it
//! returns `NoChange` instead.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::math;
use crate::domain::types::Side;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingMode {
    Staircase,
    Atr,
    Dynamic,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfig {
    /// Extra ROI % above fee break-even before arming.
    pub break_even_buffer: Decimal,
    /// ROI gain required between successive advances.
    pub trailing_step_percent: Decimal,
    /// Additional ROI locked per advance.
    pub trailing_move_percent: Decimal,
    pub trailing_mode: TrailingMode,
}

impl Default for TrailingConfig {
    fn default() -> Self {
        Self {
            break_even_buffer: Decimal::new(1, 1),        // 0.1
            trailing_step_percent: Decimal::new(15, 2),   // 0.15
            trailing_move_percent: Decimal::new(5, 2),    // 0.05
            trailing_mode: TrailingMode::Staircase,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    NoChange,
    BreakEven,
    TrailingAdvance,
}

/// Outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct StopDecision {
    /// Proposed stop price; `None` when nothing should move.
    pub new_stop: Option<Decimal>,
    pub new_last_step: u32,
    pub reason: StopReason,
    pub break_even_armed: bool,
}

impl StopDecision {
    fn unchanged(last_step: u32, armed: bool) -> Self {
        Self {
            new_stop: None,
            new_last_step: last_step,
            reason: StopReason::NoChange,
            break_even_armed: armed,
        }
    }
}

/// Inputs describing the protected position at evaluation time.
#[derive(Debug, Clone)]
pub struct StopContext {
    pub side: Side,
    pub entry: Decimal,
    pub current_stop: Option<Decimal>,
    pub leverage: u32,
    pub entry_fee_rate: Decimal,
    pub exit_fee_rate: Decimal,
    pub current_roi: Decimal,
    pub last_roi_step: u32,
    pub break_even_armed: bool,
}

/// Stop price that locks `locked_roi` percent of margin.
fn stop_for_locked_roi(
    side: Side,
    entry: Decimal,
    locked_roi: Decimal,
    leverage: u32,
) -> EngineResult<Decimal> {
    let lev = Decimal::from(leverage);
    if leverage == 0 {
        return Err(EngineError::invalid_input("leverage must be >= 1"));
    }
    let offset = locked_roi / (lev * Decimal::ONE_HUNDRED);
    Ok(match side {
        Side::Long => entry * (Decimal::ONE + offset),
        Side::Short => entry * (Decimal::ONE - offset),
    })
}

fn is_favorable_move(side: Side, candidate: Decimal, current: Option<Decimal>) -> bool {
    match current {
        None => true,
        Some(current) => match side {
            Side::Long => candidate > current,
            Side::Short => candidate < current,
        },
    }
}

/// Evaluate the protection policy for one position.
///
/// Staircase semantics: once armed at the fee-adjusted break-even ROI, each
/// full `trailing_step_percent` of further ROI gain advances the locked ROI
/// by `trailing_move_percent`, anchored at the break-even level so the stop
/// ladder never retreats below the armed stop.
pub fn next_stop(ctx: &StopContext, config: &TrailingConfig) -> EngineResult<StopDecision> {
    if ctx.entry <= Decimal::ZERO {
        return Err(EngineError::invalid_input("entry price must be positive"));
    }
    if config.trailing_mode != TrailingMode::Staircase {
        return Err(EngineError::invalid_input(
            "only staircase trailing is implemented",
        ));
    }

    let break_even_roi = math::calculate_fee_adjusted_break_even(
        ctx.entry_fee_rate,
        ctx.exit_fee_rate,
        ctx.leverage,
        config.break_even_buffer,
    )?;

    if !ctx.break_even_armed {
        if ctx.current_roi < break_even_roi {
            return Ok(StopDecision::unchanged(ctx.last_roi_step, false));
        }
        let candidate = stop_for_locked_roi(ctx.side, ctx.entry, break_even_roi, ctx.leverage)?;
        if !is_favorable_move(ctx.side, candidate, ctx.current_stop) {
            return Ok(StopDecision::unchanged(ctx.last_roi_step, false));
        }
        return Ok(StopDecision {
            new_stop: Some(candidate),
            new_last_step: 0,
            reason: StopReason::BreakEven,
            break_even_armed: true,
        });
    }

    // Armed: the last trailed ROI level is the break-even anchor plus the
    // steps already taken.
    let last_trailed_roi =
        break_even_roi + Decimal::from(ctx.last_roi_step) * config.trailing_step_percent;
    let steps = math::calculate_trailing_steps(
        ctx.current_roi,
        last_trailed_roi,
        config.trailing_step_percent,
    )?;
    if steps == 0 {
        return Ok(StopDecision::unchanged(ctx.last_roi_step, true));
    }

    let new_last_step = ctx.last_roi_step + steps;
    let locked_roi =
        break_even_roi + Decimal::from(new_last_step) * config.trailing_move_percent;
    let candidate = stop_for_locked_roi(ctx.side, ctx.entry, locked_roi, ctx.leverage)?;
    if !is_favorable_move(ctx.side, candidate, ctx.current_stop) {
        return Ok(StopDecision::unchanged(ctx.last_roi_step, true));
    }

    Ok(StopDecision {
        new_stop: Some(candidate),
        new_last_step,
        reason: StopReason::TrailingAdvance,
        break_even_armed: true,
    })
}
