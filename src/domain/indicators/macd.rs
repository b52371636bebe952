use super::ema::Ema;
use super::{Indicator, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MacdOutput {
    pub macd: Decimal,
    pub signal: Decimal,
    pub histogram: Decimal,
}

/// Moving average convergence/divergence: fast EMA minus slow EMA, with a
/// signal EMA of the MACD line and histogram = MACD - signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Macd {
    fast: Ema,
    slow: Ema,
    signal: Ema,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self {
            fast: Ema::new(fast_period),
            slow: Ema::new(slow_period),
            signal: Ema::new(signal_period),
        }
    }

    pub fn update_close(&mut self, close: Decimal) {
        self.fast.update_value(close);
        self.slow.update_value(close);
        if let (Some(fast), Some(slow)) = (self.fast.value(), self.slow.value()) {
            self.signal.update_value(fast - slow);
        }
    }

    pub fn value(&self) -> Option<MacdOutput> {
        let fast = self.fast.value()?;
        let slow = self.slow.value()?;
        let signal = self.signal.value()?;
        let macd = fast - slow;
        Some(MacdOutput {
            macd,
            signal,
            histogram: macd - signal,
        })
    }
}

impl Indicator for Macd {
    fn name(&self) -> &'static str {
        "macd"
    }

    fn update(&mut self, candle: &Candle) {
        self.update_close(candle.close);
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
        self.signal.reset();
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("macd state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("macd", state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_undefined_until_signal_warm() {
        let mut macd = Macd::new(2, 3, 2);
        macd.update_close(dec!(10));
        macd.update_close(dec!(11));
        assert!(macd.value().is_none());
        macd.update_close(dec!(12));
        // Slow is seeded now, signal has one sample of its two.
        assert!(macd.value().is_none());
        macd.update_close(dec!(13));
        assert!(macd.value().is_some());
    }

    #[test]
    fn test_histogram_is_macd_minus_signal() {
        let mut macd = Macd::new(2, 4, 3);
        for i in 0..20 {
            macd.update_close(Decimal::from(100 + (i % 5)));
        }
        let out = macd.value().unwrap();
        assert_eq!(out.histogram, out.macd - out.signal);
    }

    #[test]
    fn test_flat_series_converges_to_zero() {
        let mut macd = Macd::new(3, 6, 4);
        for _ in 0..50 {
            macd.update_close(dec!(250));
        }
        let out = macd.value().unwrap();
        let tolerance = dec!(0.000000000000000001);
        assert!(out.macd.abs() < tolerance, "macd {}", out.macd);
        assert!(out.signal.abs() < tolerance, "signal {}", out.signal);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut live = Macd::new(12, 26, 9);
        for i in 0..60 {
            live.update_close(Decimal::from(1000 + (i * 11) % 37));
        }
        let snap = live.snapshot();

        let mut restored = Macd::new(12, 26, 9);
        restored.restore(&snap).unwrap();
        live.update_close(dec!(1017));
        restored.update_close(dec!(1017));
        assert_eq!(live.value(), restored.value());
    }
}
