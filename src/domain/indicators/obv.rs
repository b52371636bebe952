use super::ema::Ema;
use super::{Indicator, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// On-balance volume: cumulative volume signed by close-to-close direction.
/// An unchanged close leaves the total untouched.
///
/// The slope accessor reports a normalized end-to-end difference over the
/// configured window, optionally smoothed with an EMA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Obv {
    slope_window: usize,
    prev_close: Option<Decimal>,
    obv: Decimal,
    window: VecDeque<Decimal>,
    smoothing: Option<Ema>,
}

impl Obv {
    pub fn new(slope_window: usize) -> Self {
        Self {
            slope_window: slope_window.max(2),
            prev_close: None,
            obv: Decimal::ZERO,
            window: VecDeque::new(),
            smoothing: None,
        }
    }

    /// Enable EMA smoothing of the slope output.
    pub fn with_smoothing(slope_window: usize, ema_period: usize) -> Self {
        let mut obv = Self::new(slope_window);
        obv.smoothing = Some(Ema::new(ema_period));
        obv
    }

    /// Raw cumulative on-balance volume.
    pub fn value(&self) -> Option<Decimal> {
        self.prev_close.map(|_| self.obv)
    }

    /// Normalized slope over the window: (end - start) / |end|.
    pub fn slope(&self) -> Option<Decimal> {
        if let Some(ema) = &self.smoothing {
            return ema.value();
        }
        self.raw_slope()
    }

    fn raw_slope(&self) -> Option<Decimal> {
        if self.window.len() < self.slope_window {
            return None;
        }
        let start = *self.window.front()?;
        let end = *self.window.back()?;
        let magnitude = end.abs();
        if magnitude.is_zero() {
            return Some(Decimal::ZERO);
        }
        Some((end - start) / magnitude)
    }
}

impl Indicator for Obv {
    fn name(&self) -> &'static str {
        "obv"
    }

    fn update(&mut self, candle: &Candle) {
        if let Some(prev) = self.prev_close {
            if candle.close > prev {
                self.obv += candle.volume;
            } else if candle.close < prev {
                self.obv -= candle.volume;
            }
        }
        self.prev_close = Some(candle.close);

        self.window.push_back(self.obv);
        if self.window.len() > self.slope_window {
            self.window.pop_front();
        }
        if self.window.len() == self.slope_window {
            if let Some(slope) = self.raw_slope() {
                if let Some(ema) = &mut self.smoothing {
                    ema.update_value(slope);
                }
            }
        }
    }

    fn reset(&mut self) {
        self.prev_close = None;
        self.obv = Decimal::ZERO;
        self.window.clear();
        if let Some(ema) = &mut self.smoothing {
            ema.reset();
        }
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("obv state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("obv", state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(close: Decimal, volume: Decimal) -> Candle {
        Candle {
            timestamp: 0,
            open: close,
            high: close,
            low: close,
            close,
            volume,
        }
    }

    #[test]
    fn test_signed_accumulation() {
        let mut obv = Obv::new(3);
        obv.update(&candle(dec!(10), dec!(100)));
        assert_eq!(obv.value(), Some(dec!(0)));
        obv.update(&candle(dec!(11), dec!(50)));
        assert_eq!(obv.value(), Some(dec!(50)));
        obv.update(&candle(dec!(10), dec!(30)));
        assert_eq!(obv.value(), Some(dec!(20)));
        // Unchanged close leaves the total untouched.
        obv.update(&candle(dec!(10), dec!(999)));
        assert_eq!(obv.value(), Some(dec!(20)));
    }

    #[test]
    fn test_slope_normalized_end_to_end() {
        let mut obv = Obv::new(3);
        obv.update(&candle(dec!(10), dec!(100)));
        obv.update(&candle(dec!(11), dec!(100)));
        obv.update(&candle(dec!(12), dec!(100)));
        // Window of OBV values: [0, 100, 200] -> (200 - 0) / 200 = 1
        assert_eq!(obv.slope(), Some(dec!(1)));
    }

    #[test]
    fn test_slope_zero_magnitude() {
        let mut obv = Obv::new(2);
        obv.update(&candle(dec!(10), dec!(100)));
        obv.update(&candle(dec!(10), dec!(100)));
        assert_eq!(obv.slope(), Some(dec!(0)));
    }

    #[test]
    fn test_smoothed_slope_uses_ema() {
        let mut obv = Obv::with_smoothing(2, 1);
        obv.update(&candle(dec!(10), dec!(100)));
        obv.update(&candle(dec!(11), dec!(100)));
        // Period-1 EMA equals the latest raw slope.
        assert_eq!(obv.slope(), Some(dec!(1)));
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut live = Obv::with_smoothing(5, 3);
        for i in 0..20i64 {
            live.update(&candle(Decimal::from(10 + (i % 4)), dec!(100)));
        }
        let snap = live.snapshot();

        let mut restored = Obv::new(5);
        restored.restore(&snap).unwrap();
        let next = candle(dec!(13), dec!(70));
        live.update(&next);
        restored.update(&next);
        assert_eq!(live.value(), restored.value());
        assert_eq!(live.slope(), restored.slope());
    }
}
