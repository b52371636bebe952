//! Shared fill/fee/slippage model for paper and demo execution.
//!
//! Market orders always pay taker fees and adverse slippage. Limit orders
//! fill as maker with a configured probability (a coarse stand-in for queue
//! position), otherwise they are treated as unfilled. A seeded generator
//! makes a simulated run reproducible.

use crate::domain::math;
use crate::domain::types::{OrderSide, Side};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use std::sync::Mutex;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    /// Adverse price movement applied to market fills, in percent.
    pub slippage_buffer_percent: Decimal,
    /// Chance a resting limit order fills as maker.
    pub maker_fill_probability: f64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            maker_fee: Decimal::new(2, 4),
            taker_fee: Decimal::new(6, 4),
            slippage_buffer_percent: Decimal::new(2, 2),
            maker_fill_probability: 0.65,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedFill {
    pub price: Decimal,
    pub fee: Decimal,
    pub is_maker: bool,
}

pub struct ExecutionSimulator {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
}

impl ExecutionSimulator {
    pub fn new(config: SimulatorConfig) -> Self {
        Self::with_seed(config, rand::rng().random())
    }

    pub fn with_seed(config: SimulatorConfig, seed: u64) -> Self {
        Self {
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn fee(&self, price: Decimal, size: Decimal, multiplier: Decimal, rate: Decimal) -> Decimal {
        price * size * multiplier * rate
    }

    /// Immediate fill at the reference price moved against the taker, with
    /// a small random spread component.
    pub fn market_fill(
        &self,
        side: OrderSide,
        reference_price: Decimal,
        size: Decimal,
        multiplier: Decimal,
    ) -> SimulatedFill {
        let jitter = {
            let mut rng = self.rng.lock().expect("simulator rng poisoned");
            rng.random_range(0.0..=1.0)
        };
        let buffer = self.config.slippage_buffer_percent
            * Decimal::from_f64(jitter).unwrap_or(Decimal::ONE);
        let offset = reference_price * buffer / Decimal::ONE_HUNDRED;
        let price = match side {
            OrderSide::Buy => reference_price + offset,
            OrderSide::Sell => reference_price - offset,
        };
        SimulatedFill {
            price,
            fee: self.fee(price, size, multiplier, self.config.taker_fee),
            is_maker: false,
        }
    }

    /// Resting limit order: maker fill at the limit price with the
    /// configured probability, `None` when the queue did not reach it.
    pub fn limit_fill(
        &self,
        limit_price: Decimal,
        size: Decimal,
        multiplier: Decimal,
    ) -> Option<SimulatedFill> {
        let filled = {
            let mut rng = self.rng.lock().expect("simulator rng poisoned");
            rng.random_bool(self.config.maker_fill_probability)
        };
        filled.then(|| SimulatedFill {
            price: limit_price,
            fee: self.fee(limit_price, size, multiplier, self.config.maker_fee),
            is_maker: true,
        })
    }

    /// Stop trigger: fills as a market order at the stop widened in the
    /// adverse direction, the worst-case execution the engine budgets for.
    pub fn stop_fill(
        &self,
        position_side: Side,
        stop_price: Decimal,
        size: Decimal,
        multiplier: Decimal,
    ) -> SimulatedFill {
        let price = math::calculate_slippage_adjusted_stop(
            position_side,
            stop_price,
            self.config.slippage_buffer_percent,
        )
        .unwrap_or(stop_price);
        SimulatedFill {
            price,
            fee: self.fee(price, size, multiplier, self.config.taker_fee),
            is_maker: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn simulator() -> ExecutionSimulator {
        ExecutionSimulator::with_seed(SimulatorConfig::default(), 42)
    }

    #[test]
    fn test_market_buy_fills_at_or_above_reference() {
        let sim = simulator();
        for _ in 0..50 {
            let fill = sim.market_fill(OrderSide::Buy, dec!(50000), dec!(0.01), dec!(1));
            assert!(fill.price >= dec!(50000));
            assert!(fill.price <= dec!(50010.0));
            assert!(!fill.is_maker);
        }
    }

    #[test]
    fn test_market_sell_fills_at_or_below_reference() {
        let sim = simulator();
        for _ in 0..50 {
            let fill = sim.market_fill(OrderSide::Sell, dec!(50000), dec!(0.01), dec!(1));
            assert!(fill.price <= dec!(50000));
        }
    }

    #[test]
    fn test_net_never_beats_gross() {
        let sim = simulator();
        let fill = sim.market_fill(OrderSide::Buy, dec!(50000), dec!(0.01), dec!(1));
        assert!(fill.fee >= Decimal::ZERO);
    }

    #[test]
    fn test_limit_fill_pays_maker_fee_at_limit_price() {
        let sim = simulator();
        let mut saw_fill = false;
        for _ in 0..100 {
            if let Some(fill) = sim.limit_fill(dec!(50100), dec!(0.01), dec!(1)) {
                saw_fill = true;
                assert!(fill.is_maker);
                assert_eq!(fill.price, dec!(50100));
                // 50100 * 0.01 * 0.0002
                assert_eq!(fill.fee, dec!(0.10020));
            }
        }
        assert!(saw_fill, "65% maker probability never filled in 100 draws");
    }

    #[test]
    fn test_stop_fill_widens_adversely() {
        let sim = simulator();
        let long_fill = sim.stop_fill(Side::Long, dec!(49750), dec!(0.01), dec!(1));
        assert!(long_fill.price < dec!(49750));
        let short_fill = sim.stop_fill(Side::Short, dec!(50250), dec!(0.01), dec!(1));
        assert!(short_fill.price > dec!(50250));
    }

    #[test]
    fn test_seeded_runs_are_reproducible() {
        let a = ExecutionSimulator::with_seed(SimulatorConfig::default(), 7);
        let b = ExecutionSimulator::with_seed(SimulatorConfig::default(), 7);
        for _ in 0..20 {
            let fa = a.market_fill(OrderSide::Buy, dec!(50000), dec!(0.01), dec!(1));
            let fb = b.market_fill(OrderSide::Buy, dec!(50000), dec!(0.01), dec!(1));
            assert_eq!(fa, fb);
        }
    }
}
