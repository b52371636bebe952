use super::{Indicator, restore_from_value};
use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Average Directional Index via Wilder smoothing.
///
/// True range and directional movement are accumulated simply over the first
/// `period` bars, then smoothed with `prev - prev/period + current`. ADX is a
/// Wilder smoothing of DX seeded with a simple average of the first `period`
/// DX values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adx {
    period: usize,
    prev: Option<(Decimal, Decimal, Decimal)>,
    warm_count: usize,
    tr_sum: Decimal,
    plus_dm_sum: Decimal,
    minus_dm_sum: Decimal,
    smoothed_tr: Option<Decimal>,
    smoothed_plus_dm: Decimal,
    smoothed_minus_dm: Decimal,
    dx_count: usize,
    dx_sum: Decimal,
    adx: Option<Decimal>,
}

impl Adx {
    pub fn new(period: usize) -> Self {
        Self {
            period: period.max(1),
            prev: None,
            warm_count: 0,
            tr_sum: Decimal::ZERO,
            plus_dm_sum: Decimal::ZERO,
            minus_dm_sum: Decimal::ZERO,
            smoothed_tr: None,
            smoothed_plus_dm: Decimal::ZERO,
            smoothed_minus_dm: Decimal::ZERO,
            dx_count: 0,
            dx_sum: Decimal::ZERO,
            adx: None,
        }
    }

    pub fn value(&self) -> Option<Decimal> {
        self.adx
    }

    /// Current +DI and -DI, available one bar earlier than ADX itself.
    pub fn directional_indexes(&self) -> Option<(Decimal, Decimal)> {
        let tr = self.smoothed_tr?;
        if tr.is_zero() {
            return Some((Decimal::ZERO, Decimal::ZERO));
        }
        let plus_di = self.smoothed_plus_dm / tr * Decimal::ONE_HUNDRED;
        let minus_di = self.smoothed_minus_dm / tr * Decimal::ONE_HUNDRED;
        Some((plus_di, minus_di))
    }

    fn dx(&self) -> Option<Decimal> {
        let (plus_di, minus_di) = self.directional_indexes()?;
        let total = plus_di + minus_di;
        if total.is_zero() {
            return Some(Decimal::ZERO);
        }
        Some((plus_di - minus_di).abs() / total * Decimal::ONE_HUNDRED)
    }
}

impl Indicator for Adx {
    fn name(&self) -> &'static str {
        "adx"
    }

    fn update(&mut self, candle: &Candle) {
        let Some((prev_high, prev_low, prev_close)) = self.prev else {
            self.prev = Some((candle.high, candle.low, candle.close));
            return;
        };
        self.prev = Some((candle.high, candle.low, candle.close));

        let tr = (candle.high - candle.low)
            .max((candle.high - prev_close).abs())
            .max((candle.low - prev_close).abs());

        let up_move = candle.high - prev_high;
        let down_move = prev_low - candle.low;
        let plus_dm = if up_move > down_move && up_move > Decimal::ZERO {
            up_move
        } else {
            Decimal::ZERO
        };
        let minus_dm = if down_move > up_move && down_move > Decimal::ZERO {
            down_move
        } else {
            Decimal::ZERO
        };

        let period = Decimal::from(self.period as u64);
        match self.smoothed_tr {
            Some(str_) => {
                self.smoothed_tr = Some(str_ - str_ / period + tr);
                self.smoothed_plus_dm =
                    self.smoothed_plus_dm - self.smoothed_plus_dm / period + plus_dm;
                self.smoothed_minus_dm =
                    self.smoothed_minus_dm - self.smoothed_minus_dm / period + minus_dm;
            }
            None => {
                self.tr_sum += tr;
                self.plus_dm_sum += plus_dm;
                self.minus_dm_sum += minus_dm;
                self.warm_count += 1;
                if self.warm_count == self.period {
                    self.smoothed_tr = Some(self.tr_sum);
                    self.smoothed_plus_dm = self.plus_dm_sum;
                    self.smoothed_minus_dm = self.minus_dm_sum;
                }
            }
        }

        if let Some(dx) = self.dx() {
            match self.adx {
                Some(adx) => {
                    self.adx = Some((adx * (period - Decimal::ONE) + dx) / period);
                }
                None => {
                    self.dx_sum += dx;
                    self.dx_count += 1;
                    if self.dx_count == self.period {
                        self.adx = Some(self.dx_sum / period);
                    }
                }
            }
        }
    }

    fn reset(&mut self) {
        *self = Adx::new(self.period);
    }

    fn snapshot(&self) -> serde_json::Value {
        serde_json::to_value(self).expect("adx state serializes")
    }

    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        *self = restore_from_value("adx", state)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            timestamp: 0,
            open: close,
            high,
            low,
            close,
            volume: dec!(1),
        }
    }

    fn trending_up(i: i64) -> Candle {
        let base = Decimal::from(100 + i * 2);
        candle(base + dec!(2), base - dec!(1), base + dec!(1))
    }

    #[test]
    fn test_warm_up_takes_two_periods() {
        let mut adx = Adx::new(3);
        // One bar for prev, `period` bars to seed the DM smoothing (the
        // first DX lands on the seeding bar), then `period` DX values.
        for i in 0..5 {
            adx.update(&trending_up(i));
            assert_eq!(adx.value(), None, "bar {} should still be warming", i);
        }
        adx.update(&trending_up(5));
        assert!(adx.value().is_some());
    }

    #[test]
    fn test_strong_trend_high_adx() {
        let mut adx = Adx::new(3);
        for i in 0..30 {
            adx.update(&trending_up(i));
        }
        // Monotonic rally: -DM is always zero, so DX pins at 100.
        let value = adx.value().unwrap();
        assert!(value > dec!(90), "got {}", value);
    }

    #[test]
    fn test_directional_indexes_favor_trend() {
        let mut adx = Adx::new(3);
        for i in 0..10 {
            adx.update(&trending_up(i));
        }
        let (plus_di, minus_di) = adx.directional_indexes().unwrap();
        assert!(plus_di > minus_di);
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let mut live = Adx::new(14);
        for i in 0..50i64 {
            let base = Decimal::from(100 + (i * 13) % 29);
            live.update(&candle(base + dec!(3), base - dec!(3), base));
        }
        let snap = live.snapshot();

        let mut restored = Adx::new(14);
        restored.restore(&snap).unwrap();
        let next = candle(dec!(131), dec!(125), dec!(128));
        live.update(&next);
        restored.update(&next);
        assert_eq!(live.value(), restored.value());
    }
}
