use super::{Indicator, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Simple moving average with a running sum; O(1) per update.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RollingSma {
    period: usize,
    window: VecDeque<Decimal>,
    sum: Decimal,
}

impl RollingSma {
    fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            window: VecDeque::new(),
            sum: Decimal::ZERO,
        }
    }

    fn push(&mut self, value: Decimal) {
        self.window.push_back(value);
        self.sum += value;
        if self.window.len() > self.period {
            if let Some(evicted) = self.window.pop_front() {
                self.sum -= evicted;
            }
        }
    }

    fn value(&self) -> Option<Decimal> {
        if self.window.len() < self.period {
            return None;
        }
        Some(self.sum / Decimal::from(self.period as u64))
    }

    fn reset(&mut self) {
        self.window.clear();
        self.sum = Decimal::ZERO;
    }
}

/// Awesome Oscillator: SMA(5) - SMA(34) of the median price (high+low)/2.
/// Undefined until the slow window is filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwesomeOscillator {
    fast: RollingSma,
    slow: RollingSma,
}

impl AwesomeOscillator {
    pub fn new() -> Self {
        Self::with_periods(5, 34)
    }

    pub fn with_periods(fast: usize, slow: usize) -> Self {
        Self {
            fast: RollingSma::new(fast),
            slow: RollingSma::new(slow),
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        Some(self.fast.value()? - self.slow.value()?)
    }
}

impl Default for AwesomeOscillator {
    fn default() -> Self {
        Self::new()
    }
}

impl Indicator for AwesomeOscillator {
    fn name(&self) -> &'static str {
        "awesome_oscillator"
    }

    fn update(&mut self, candle: &Candle) {
        let median = candle.median_price();
        self.fast.push(median);
        self.slow.push(median);
    }

    fn reset(&mut self) {
        self.fast.reset();
        self.slow.reset();
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("awesome oscillator state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("awesome_oscillator", state)?;
        Ok(())
    }
}
