//! Leverage-aware position math.
//!
//! Every monetary quantity in the engine flows through these functions as
//! `rust_decimal::Decimal`; callers convert to plain floats only at display
//! boundaries. All ROI arguments are percentages (0.5 = 0.5%), fee arguments
//! are rates (0.0006 = 0.06%).

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::types::Side;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Rounding direction for tick/lot alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundDirection {
    Nearest,
    Up,
    Down,
}

fn ensure_positive(value: Decimal, name: &str) -> EngineResult<()> {
    if value <= Decimal::ZERO {
        return Err(EngineError::invalid_input(format!(
            "{} must be positive, got {}",
            name, value
        )));
    }
    Ok(())
}

fn ensure_non_negative(value: Decimal, name: &str) -> EngineResult<()> {
    if value < Decimal::ZERO {
        return Err(EngineError::invalid_input(format!(
            "{} must not be negative, got {}",
            name, value
        )));
    }
    Ok(())
}

fn ensure_leverage(leverage: u32) -> EngineResult<Decimal> {
    if leverage == 0 {
        return Err(EngineError::invalid_input("leverage must be >= 1"));
    }
    Ok(Decimal::from(leverage))
}

/// Margin committed for a position: balance x percent / 100.
pub fn calculate_margin_used(balance: Decimal, percent: Decimal) -> EngineResult<Decimal> {
    ensure_non_negative(balance, "balance")?;
    ensure_positive(percent, "position percent")?;
    Ok(balance * percent / HUNDRED)
}

/// Notional exposure bought with `margin` at `leverage`.
pub fn calculate_position_value(margin: Decimal, leverage: u32) -> EngineResult<Decimal> {
    ensure_non_negative(margin, "margin")?;
    let lev = ensure_leverage(leverage)?;
    Ok(margin * lev)
}

/// Contract quantity for a notional, floored to the contract's lot step and
/// clamped into its min/max order-quantity bounds.
pub fn calculate_lot_size(
    notional: Decimal,
    entry_price: Decimal,
    multiplier: Decimal,
    lot_step: Decimal,
    min_qty: Decimal,
    max_qty: Decimal,
) -> EngineResult<Decimal> {
    ensure_positive(entry_price, "entry price")?;
    ensure_positive(multiplier, "multiplier")?;
    ensure_positive(lot_step, "lot step")?;
    let raw = notional / (entry_price * multiplier);
    let floored = round_to_lot(raw, lot_step)?;
    Ok(floored.clamp(min_qty, max_qty))
}

/// Initial stop-loss price for an ROI risk target.
///
/// Long: entry x (1 - r/(L*100)); short: entry x (1 + r/(L*100)).
pub fn calculate_stop_loss_price(
    side: Side,
    entry: Decimal,
    roi_risk_percent: Decimal,
    leverage: u32,
) -> EngineResult<Decimal> {
    ensure_positive(entry, "entry price")?;
    ensure_positive(roi_risk_percent, "roi risk percent")?;
    let lev = ensure_leverage(leverage)?;
    let offset = roi_risk_percent / (lev * HUNDRED);
    Ok(match side {
        Side::Long => entry * (Decimal::ONE - offset),
        Side::Short => entry * (Decimal::ONE + offset),
    })
}

/// Take-profit price for an ROI reward target; opposite direction to the stop.
pub fn calculate_take_profit_price(
    side: Side,
    entry: Decimal,
    roi_reward_percent: Decimal,
    leverage: u32,
) -> EngineResult<Decimal> {
    ensure_positive(entry, "entry price")?;
    ensure_positive(roi_reward_percent, "roi reward percent")?;
    let lev = ensure_leverage(leverage)?;
    let offset = roi_reward_percent / (lev * HUNDRED);
    Ok(match side {
        Side::Long => entry * (Decimal::ONE + offset),
        Side::Short => entry * (Decimal::ONE - offset),
    })
}

/// ROI percent at which entry + exit fees are covered, plus a safety buffer.
///
/// Fees are rates; the leverage factor converts a notional-relative cost into
/// a margin-relative ROI.
pub fn calculate_fee_adjusted_break_even(
    entry_fee: Decimal,
    exit_fee: Decimal,
    leverage: u32,
    buffer_percent: Decimal,
) -> EngineResult<Decimal> {
    ensure_non_negative(entry_fee, "entry fee")?;
    ensure_non_negative(exit_fee, "exit fee")?;
    ensure_non_negative(buffer_percent, "buffer percent")?;
    let lev = ensure_leverage(leverage)?;
    Ok((entry_fee + exit_fee) * lev * HUNDRED + buffer_percent)
}

/// Price at which the exchange liquidates the position.
///
/// Long: entry x (1 - (1/L)(1 + mm/100)); symmetric for short.
pub fn calculate_liquidation_price(
    side: Side,
    entry: Decimal,
    leverage: u32,
    maintenance_margin_percent: Decimal,
) -> EngineResult<Decimal> {
    ensure_positive(entry, "entry price")?;
    ensure_non_negative(maintenance_margin_percent, "maintenance margin")?;
    let lev = ensure_leverage(leverage)?;
    let offset = (Decimal::ONE / lev) * (Decimal::ONE + maintenance_margin_percent / HUNDRED);
    Ok(match side {
        Side::Long => entry * (Decimal::ONE - offset),
        Side::Short => entry * (Decimal::ONE + offset),
    })
}

/// Widens a stop price in the adverse direction by a slippage buffer, so the
/// triggered market order has room to fill before the position bleeds past
/// the intended risk.
pub fn calculate_slippage_adjusted_stop(
    side: Side,
    stop_price: Decimal,
    slippage_buffer_percent: Decimal,
) -> EngineResult<Decimal> {
    ensure_positive(stop_price, "stop price")?;
    ensure_non_negative(slippage_buffer_percent, "slippage buffer")?;
    let offset = slippage_buffer_percent / HUNDRED;
    Ok(match side {
        Side::Long => stop_price * (Decimal::ONE - offset),
        Side::Short => stop_price * (Decimal::ONE + offset),
    })
}

/// Number of whole staircase steps earned between two ROI readings.
/// Never negative; a retreating ROI earns zero steps.
pub fn calculate_trailing_steps(
    current_roi: Decimal,
    last_trailed_roi: Decimal,
    step_percent: Decimal,
) -> EngineResult<u32> {
    ensure_positive(step_percent, "trailing step percent")?;
    let gained = current_roi - last_trailed_roi;
    if gained <= Decimal::ZERO {
        return Ok(0);
    }
    let steps = (gained / step_percent).floor();
    Ok(steps.to_u32().unwrap_or(u32::MAX))
}

/// Signed price move in the position's favor: positive when in profit.
pub fn signed_price_diff(side: Side, entry: Decimal, mark: Decimal) -> Decimal {
    match side {
        Side::Long => mark - entry,
        Side::Short => entry - mark,
    }
}

/// Unrealized PnL for a signed price diff.
pub fn calculate_unrealized_pnl(price_diff: Decimal, size: Decimal, multiplier: Decimal) -> Decimal {
    price_diff * size * multiplier
}

/// ROI as a percent of margin used.
pub fn calculate_roi_percent(unrealized_pnl: Decimal, margin_used: Decimal) -> EngineResult<Decimal> {
    ensure_positive(margin_used, "margin used")?;
    Ok(unrealized_pnl / margin_used * HUNDRED)
}

/// Aligns a price to the contract tick grid.
///
/// `Nearest` resolves midpoints away from zero; stop placement uses the
/// directed variants so a stop is never rounded across the trigger level in
/// the adverse direction.
pub fn round_to_tick_directed(
    price: Decimal,
    tick_size: Decimal,
    direction: RoundDirection,
) -> EngineResult<Decimal> {
    ensure_positive(tick_size, "tick size")?;
    let units = price / tick_size;
    let rounded_units = match direction {
        RoundDirection::Nearest => {
            units.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        }
        RoundDirection::Up => units.ceil(),
        RoundDirection::Down => units.floor(),
    };
    Ok(rounded_units * tick_size)
}

/// Nearest-multiple tick rounding.
pub fn round_to_tick(price: Decimal, tick_size: Decimal) -> EngineResult<Decimal> {
    round_to_tick_directed(price, tick_size, RoundDirection::Nearest)
}

/// Rounds a size down to the lot grid. Sizes always round down so an order
/// never exceeds the margin that was reserved for it.
pub fn round_to_lot(size: Decimal, lot_size: Decimal) -> EngineResult<Decimal> {
    ensure_positive(lot_size, "lot size")?;
    Ok((size / lot_size).floor() * lot_size)
}

/// Tick rounding for a stop price: the favorable direction for a long stop is
/// up, for a short stop is down.
pub fn round_stop_to_tick(side: Side, price: Decimal, tick_size: Decimal) -> EngineResult<Decimal> {
    match side {
        Side::Long => round_to_tick_directed(price, tick_size, RoundDirection::Up),
        Side::Short => round_to_tick_directed(price, tick_size, RoundDirection::Down),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_sizing_scenario() {
        // Balance 10,000 at 0.5% and 10x leverage, entry 50,000, multiplier 1.
        let margin = calculate_margin_used(dec!(10000), dec!(0.5)).unwrap();
        assert_eq!(margin, dec!(50.00));

        let notional = calculate_position_value(margin, 10).unwrap();
        assert_eq!(notional, dec!(500.00));

        let lot = calculate_lot_size(
            notional,
            dec!(50000),
            dec!(1),
            dec!(0.001),
            dec!(0.001),
            dec!(1000),
        )
        .unwrap();
        assert_eq!(lot, dec!(0.01));
    }

    #[test]
    fn test_notional_identity_is_exact() {
        let margin = calculate_margin_used(dec!(10000), dec!(0.5)).unwrap();
        let notional = calculate_position_value(margin, 10).unwrap();
        assert_eq!(margin * dec!(10), notional);
    }

    #[test]
    fn test_lot_size_clamps_to_contract_bounds() {
        // Tiny notional is lifted to the minimum order quantity.
        let lot = calculate_lot_size(
            dec!(1),
            dec!(50000),
            dec!(1),
            dec!(0.001),
            dec!(0.001),
            dec!(1000),
        )
        .unwrap();
        assert_eq!(lot, dec!(0.001));

        // Oversized notional is capped at the maximum.
        let lot = calculate_lot_size(
            dec!(100000000),
            dec!(50000),
            dec!(1),
            dec!(0.001),
            dec!(0.001),
            dec!(10),
        )
        .unwrap();
        assert_eq!(lot, dec!(10));
    }

    #[test]
    fn test_initial_stop_long() {
        // Entry 100, 10x, 0.5% ROI risk -> 99.95; TP at 2.0% -> 100.20.
        let stop = calculate_stop_loss_price(Side::Long, dec!(100), dec!(0.5), 10).unwrap();
        assert_eq!(stop, dec!(99.95));

        let tp = calculate_take_profit_price(Side::Long, dec!(100), dec!(2.0), 10).unwrap();
        assert_eq!(tp, dec!(100.20));
    }

    #[test]
    fn test_stop_direction_property() {
        let entry = dec!(37891.5);
        for leverage in [1u32, 5, 25, 125] {
            for risk in [dec!(0.01), dec!(0.5), dec!(10), dec!(100)] {
                let long = calculate_stop_loss_price(Side::Long, entry, risk, leverage).unwrap();
                let short = calculate_stop_loss_price(Side::Short, entry, risk, leverage).unwrap();
                assert!(long < entry, "long stop must sit below entry");
                assert!(short > entry, "short stop must sit above entry");

                let tp_long = calculate_take_profit_price(Side::Long, entry, risk, leverage).unwrap();
                let tp_short =
                    calculate_take_profit_price(Side::Short, entry, risk, leverage).unwrap();
                assert!(tp_long > entry);
                assert!(tp_short < entry);
            }
        }
    }

    #[test]
    fn test_fee_adjusted_break_even() {
        // 0.06% each way at 10x with a 0.1% buffer -> 1.3% ROI.
        let be =
            calculate_fee_adjusted_break_even(dec!(0.0006), dec!(0.0006), 10, dec!(0.1)).unwrap();
        assert_eq!(be, dec!(1.3));
    }

    #[test]
    fn test_liquidation_long() {
        // Entry 10,000 at 10x with 0.5% maintenance margin.
        let liq = calculate_liquidation_price(Side::Long, dec!(10000), 10, dec!(0.5)).unwrap();
        assert_eq!(liq, dec!(8995));
    }

    #[test]
    fn test_liquidation_beyond_stop() {
        // Any stop computed from ROI <= 50% sits between entry and liquidation.
        for leverage in [2u32, 10, 50] {
            let entry = dec!(10000);
            let liq =
                calculate_liquidation_price(Side::Long, entry, leverage, dec!(0.5)).unwrap();
            for risk in [dec!(0.5), dec!(10), dec!(50)] {
                let stop = calculate_stop_loss_price(Side::Long, entry, risk, leverage).unwrap();
                assert!(liq < stop, "liquidation {} must be below stop {}", liq, stop);
            }
        }
    }

    #[test]
    fn test_slippage_widens_adverse() {
        let long = calculate_slippage_adjusted_stop(Side::Long, dec!(100), dec!(0.02)).unwrap();
        assert_eq!(long, dec!(99.98));
        let short = calculate_slippage_adjusted_stop(Side::Short, dec!(100), dec!(0.02)).unwrap();
        assert_eq!(short, dec!(100.02));
    }

    #[test]
    fn test_trailing_steps_never_negative() {
        assert_eq!(
            calculate_trailing_steps(dec!(1.0), dec!(2.0), dec!(0.15)).unwrap(),
            0
        );
        assert_eq!(
            calculate_trailing_steps(dec!(1.45), dec!(1.30), dec!(0.15)).unwrap(),
            1
        );
        assert_eq!(
            calculate_trailing_steps(dec!(1.75), dec!(1.30), dec!(0.15)).unwrap(),
            3
        );
    }

    #[test]
    fn test_pnl_and_roi() {
        let diff = signed_price_diff(Side::Long, dec!(50000), dec!(50065));
        let pnl = calculate_unrealized_pnl(diff, dec!(0.01), dec!(1));
        assert_eq!(pnl, dec!(0.65));
        let roi = calculate_roi_percent(pnl, dec!(50)).unwrap();
        assert_eq!(roi, dec!(1.30));
    }

    #[test]
    fn test_short_pnl_sign() {
        let diff = signed_price_diff(Side::Short, dec!(50000), dec!(50065));
        assert_eq!(diff, dec!(-65));
    }

    #[test]
    fn test_tick_rounding() {
        assert_eq!(round_to_tick(dec!(100.07), dec!(0.05)).unwrap(), dec!(100.05));
        // Midpoint resolves away from zero.
        assert_eq!(round_to_tick(dec!(100.075), dec!(0.05)).unwrap(), dec!(100.10));
        assert_eq!(
            round_stop_to_tick(Side::Long, dec!(100.01), dec!(0.05)).unwrap(),
            dec!(100.05)
        );
        assert_eq!(
            round_stop_to_tick(Side::Short, dec!(100.04), dec!(0.05)).unwrap(),
            dec!(100.00)
        );
    }

    #[test]
    fn test_lot_rounding_always_down() {
        assert_eq!(round_to_lot(dec!(0.0199), dec!(0.001)).unwrap(), dec!(0.019));
        assert_eq!(round_to_lot(dec!(5.9), dec!(1)).unwrap(), dec!(5));
    }

    #[test]
    fn test_invalid_inputs_rejected() {
        assert!(calculate_stop_loss_price(Side::Long, dec!(-1), dec!(0.5), 10).is_err());
        assert!(calculate_stop_loss_price(Side::Long, dec!(100), dec!(0.5), 0).is_err());
        assert!(calculate_roi_percent(dec!(1), Decimal::ZERO).is_err());
        assert!(round_to_tick(dec!(100), Decimal::ZERO).is_err());
    }
}
