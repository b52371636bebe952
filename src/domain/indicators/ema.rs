use super::{Indicator, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Exponential moving average with smoothing 2/(period+1).
///
/// Warm-up seeds the average with a simple mean of the first `period`
/// samples, matching standard charting packages; seeding from the first
/// sample alone skews the early curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ema {
    period: usize,
    alpha: Decimal,
    seed_sum: Decimal,
    seed_count: usize,
    current: Option<Decimal>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        let p = Decimal::from(period.max(1) as u64);
        Self {
            period: period.max(1),
            alpha: Decimal::TWO / (p + Decimal::ONE),
            seed_sum: Decimal::ZERO,
            seed_count: 0,
            current: None,
        }
    }

    pub fn update_value(&mut self, value: Decimal) {
        match self.current {
            Some(prev) => {
                self.current = Some(self.alpha * value + (Decimal::ONE - self.alpha) * prev);
            }
            None => {
                self.seed_sum += value;
                self.seed_count += 1;
                if self.seed_count == self.period {
                    self.current = Some(self.seed_sum / Decimal::from(self.period as u64));
                }
            }
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        self.current
    }

    pub fn period(&self) -> usize {
        self.period
    }
}

impl Indicator for Ema {
    fn name(&self) -> &'static str {
        "ema"
    }

    fn update(&mut self, candle: &Candle) {
        self.update_value(candle.close);
    }

    fn reset(&mut self) {
        self.seed_sum = Decimal::ZERO;
        self.seed_count = 0;
        self.current = None;
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("ema state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("ema", state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_warm_up_seeds_with_simple_mean() {
        let mut ema = Ema::new(3);
        ema.update_value(dec!(10));
        assert_eq!(ema.value(), None);
        ema.update_value(dec!(20));
        assert_eq!(ema.value(), None);
        ema.update_value(dec!(30));
        // Simple mean of the first three samples.
        assert_eq!(ema.value(), Some(dec!(20)));
    }

    #[test]
    fn test_smoothing_after_seed() {
        let mut ema = Ema::new(3);
        for v in [dec!(10), dec!(20), dec!(30)] {
            ema.update_value(v);
        }
        ema.update_value(dec!(40));
        // alpha = 0.5: 0.5*40 + 0.5*20 = 30
        assert_eq!(ema.value(), Some(dec!(30)));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut live = Ema::new(5);
        for v in 1..=7 {
            live.update_value(Decimal::from(v));
        }
        let snap = live.snapshot();

        let mut restored = Ema::new(5);
        restored.restore(&snap).unwrap();
        live.update_value(dec!(42));
        restored.update_value(dec!(42));
        assert_eq!(live.value(), restored.value());
    }
}
