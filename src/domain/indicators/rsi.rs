use super::{Indicator, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Relative Strength Index with Wilder smoothing.
///
/// Warm-up requires `period + 1` closes: the first `period` up/down moves are
/// averaged simply, subsequent moves are blended with
/// `(prev * (period - 1) + current) / period`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rsi {
    period: usize,
    prev_close: Option<Decimal>,
    move_count: usize,
    gain_sum: Decimal,
    loss_sum: Decimal,
    avg_gain: Option<Decimal>,
    avg_loss: Option<Decimal>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev_close: None,
            move_count: 0,
            gain_sum: Decimal::ZERO,
            loss_sum: Decimal::ZERO,
            avg_gain: None,
            avg_loss: None,
        }
    }

    /// Seed from a slice of historical closes, oldest first.
    pub fn with_history(period: usize, closes: &[Decimal]) -> Self {
        let mut rsi = Self::new(period);
        for close in closes {
            rsi.update_close(*close);
        }
        rsi
    }

    pub fn update_close(&mut self, close: Decimal) {
        let Some(prev) = self.prev_close else {
            self.prev_close = Some(close);
            return;
        };
        self.prev_close = Some(close);

        let change = close - prev;
        let gain = change.max(Decimal::ZERO);
        let loss = (-change).max(Decimal::ZERO);
        let period = Decimal::from(self.period as u64);

        match (self.avg_gain, self.avg_loss) {
            (Some(ag), Some(al)) => {
                self.avg_gain = Some((ag * (period - Decimal::ONE) + gain) / period);
                self.avg_loss = Some((al * (period - Decimal::ONE) + loss) / period);
            }
            _ => {
                self.gain_sum += gain;
                self.loss_sum += loss;
                self.move_count += 1;
                if self.move_count == self.period {
                    self.avg_gain = Some(self.gain_sum / period);
                    self.avg_loss = Some(self.loss_sum / period);
                }
            }
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        let avg_gain = self.avg_gain?;
        let avg_loss = self.avg_loss?;
        if avg_loss.is_zero() {
            return Some(Decimal::ONE_HUNDRED);
        }
        if avg_gain.is_zero() {
            return Some(Decimal::ZERO);
        }
        let rs = avg_gain / avg_loss;
        Some(Decimal::ONE_HUNDRED - Decimal::ONE_HUNDRED / (Decimal::ONE + rs))
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "rsi"
    }

    fn update(&mut self, candle: &Candle) {
        self.update_close(candle.close);
    }

    fn reset(&mut self) {
        *self = Rsi::new(self.period);
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("rsi state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("rsi", state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_warm_up_needs_period_plus_one_closes() {
        let mut rsi = Rsi::new(3);
        for close in [dec!(10), dec!(11), dec!(12)] {
            rsi.update_close(close);
            assert_eq!(rsi.value(), None);
        }
        rsi.update_close(dec!(13));
        assert!(rsi.value().is_some());
    }

    #[test]
    fn test_all_gains_returns_100() {
        let mut rsi = Rsi::new(3);
        for close in [dec!(10), dec!(11), dec!(12), dec!(13), dec!(14)] {
            rsi.update_close(close);
        }
        assert_eq!(rsi.value(), Some(dec!(100)));
    }

    #[test]
    fn test_all_losses_returns_0() {
        let mut rsi = Rsi::new(3);
        for close in [dec!(14), dec!(13), dec!(12), dec!(11), dec!(10)] {
            rsi.update_close(close);
        }
        assert_eq!(rsi.value(), Some(dec!(0)));
    }

    #[test]
    fn test_wilder_smoothing_sequence() {
        // Mixed moves: +1, -2, +3 over period 3 -> avg_gain 4/3, avg_loss 2/3.
        let mut rsi = Rsi::new(3);
        for close in [dec!(10), dec!(11), dec!(9), dec!(12)] {
            rsi.update_close(close);
        }
        // rs = 2, rsi = 100 - 100/3
        let value = rsi.value().unwrap();
        let expected = dec!(100) - dec!(100) / dec!(3);
        assert!((value - expected).abs() < dec!(0.000001), "rsi {}", value);
    }

    #[test]
    fn test_with_history_matches_incremental() {
        let closes = [dec!(44), dec!(44.34), dec!(44.09), dec!(44.15), dec!(43.61)];
        let seeded = Rsi::with_history(3, &closes);
        let mut incremental = Rsi::new(3);
        for c in closes {
            incremental.update_close(c);
        }
        assert_eq!(seeded.value(), incremental.value());
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut live = Rsi::new(14);
        for i in 0..30 {
            let close = Decimal::from(100 + (i * 7) % 13);
            live.update_close(close);
        }
        let snap = live.snapshot();

        let mut restored = Rsi::new(14);
        restored.restore(&snap).unwrap();
        live.update_close(dec!(104.5));
        restored.update_close(dec!(104.5));
        assert_eq!(live.value(), restored.value());
    }
}
