use super::{Indicator, RollingExtremum, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KdjOutput {
    pub k: Decimal,
    pub d: Decimal,
    /// J = 3K - 2D; may leave [0, 100].
    pub j: Decimal,
}

/// KDJ stochastic oscillator.
///
/// RSV over the last `period` bars, K as a Wilder-style smoothing of RSV
/// with factor `k_period`, D as an SMA of K over `d_period`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kdj {
    period: usize,
    k_period: usize,
    d_period: usize,
    highs: RollingExtremum,
    lows: RollingExtremum,
    k: Option<Decimal>,
    k_window: VecDeque<Decimal>,
    k_sum: Decimal,
}

impl Kdj {
    pub fn new(period: usize, k_period: usize, d_period: usize) -> Self {
        let period = period.max(1);
        Self {
            period,
            k_period: k_period.max(1),
            d_period: d_period.max(1),
            highs: RollingExtremum::max(period),
            lows: RollingExtremum::min(period),
            k: None,
            k_window: VecDeque::new(),
            k_sum: Decimal::ZERO,
        }
    }

    fn rsv(&self, close: Decimal) -> Decimal {
        let (Some(max_high), Some(min_low)) = (self.highs.value(), self.lows.value()) else {
            return Decimal::from(50);
        };
        let range = max_high - min_low;
        if range.is_zero() {
            // Flat window carries no directional information.
            return Decimal::from(50);
        }
        (close - min_low) / range * Decimal::ONE_HUNDRED
    }

    pub fn value(&self) -> Option<KdjOutput> {
        let k = self.k?;
        if self.k_window.len() < self.d_period {
            return None;
        }
        let d = self.k_sum / Decimal::from(self.d_period as u64);
        Some(KdjOutput {
            k,
            d,
            j: Decimal::from(3) * k - Decimal::TWO * d,
        })
    }
}

impl Indicator for Kdj {
    fn name(&self) -> &'static str {
        "kdj"
    }

    fn update(&mut self, candle: &Candle) {
        self.highs.push(candle.high);
        self.lows.push(candle.low);
        if !self.highs.is_saturated() {
            return;
        }

        let rsv = self.rsv(candle.close);
        let kp = Decimal::from(self.k_period as u64);
        let prev_k = self.k.unwrap_or_else(|| Decimal::from(50));
        let k = (prev_k * (kp - Decimal::ONE) + rsv) / kp;
        self.k = Some(k);

        self.k_window.push_back(k);
        self.k_sum += k;
        if self.k_window.len() > self.d_period {
            if let Some(evicted) = self.k_window.pop_front() {
                self.k_sum -= evicted;
            }
        }
    }

    fn reset(&mut self) {
        self.highs.reset();
        self.lows.reset();
        self.k = None;
        self.k_window.clear();
        self.k_sum = Decimal::ZERO;
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("kdj state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("kdj", state)?;
        Ok(())
    }
}
