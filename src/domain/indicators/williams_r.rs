use super::{Indicator, RollingExtremum, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Williams %R over the last `period` bars:
/// (max_high - close) / (max_high - min_low) x -100.
/// A flat range yields 0.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WilliamsR {
    period: usize,
    highs: RollingExtremum,
    lows: RollingExtremum,
    last_close: Option<Decimal>,
}

impl WilliamsR {
    pub fn new(period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            highs: RollingExtremum::max(period),
            lows: RollingExtremum::min(period),
            last_close: None,
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        if !self.highs.is_saturated() {
            return None;
        }
        let max_high = self.highs.value()?;
        let min_low = self.lows.value()?;
        let close = self.last_close?;
        let range = max_high - min_low;
        if range.is_zero() {
            return Some(Decimal::ZERO);
        }
        Some((max_high - close) / range * Decimal::NEGATIVE_ONE * Decimal::ONE_HUNDRED)
    }
}

impl Indicator for WilliamsR {
    fn name(&self) -> &'static str {
        "williams_r"
    }

    fn update(&mut self, candle: &Candle) {
        self.highs.push(candle.high);
        self.lows.push(candle.low);
        self.last_close = Some(candle.close);
    }

    fn reset(&mut self) {
        self.highs.reset();
        self.lows.reset();
        self.last_close = None;
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("williams %r state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("williams_r", state)?;
        Ok(())
    }
}
