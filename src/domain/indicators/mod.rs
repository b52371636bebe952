//! Incremental technical-indicator engines.
//!
//! Every engine advances in O(1) time per closed candle and keeps O(1) state
//! beyond its rolling window. State is serializable so a live engine and a
//! backtest engine restored from a snapshot produce identical outputs.
//!
//! Engines return `None` from their value accessors while warming up; they
//! never error on ordinary price data.

mod adx;
mod awesome;
mod ema;
mod kdj;
mod macd;
mod obv;
mod rsi;
mod williams_r;

pub use adx::Adx;
pub use awesome::AwesomeOscillator;
pub use ema::Ema;
pub use kdj::{Kdj, KdjOutput};
pub use macd::{Macd, MacdOutput};
pub use obv::Obv;
pub use rsi::Rsi;
pub use williams_r::WilliamsR;

use crate::domain::errors::EngineResult;
use crate::domain::types::Candle;

/// Capability set shared by all indicator engines.
pub trait Indicator: Send {
    fn name(&self) -> &'static str;

    /// Advance state by one closed candle.
    fn update(&mut self, candle: &Candle);

    /// Clear all state back to construction.
    fn reset(&mut self);

    /// Serialize the resume state.
    fn snapshot(&self) -> serde_json::Value;

    /// Restore from a snapshot produced by the same engine kind.
    fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()>;
}

pub(crate) fn restore_from_value<T: serde::de::DeserializeOwned>(
    name: &str,
    state: &serde_json::Value,
) -> EngineResult<T> {
    serde_json::from_value(state.clone()).map_err(|e| {
        crate::domain::errors::EngineError::invalid_input(format!(
            "bad {} snapshot: {}",
            name, e
        ))
    })
}

/// Rolling extremum tracker over a fixed window, amortized O(1) per push.
///
/// Keeps a monotonic deque of (index, value); the front is always the current
/// window extremum.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub(crate) struct RollingExtremum {
    window: usize,
    next_index: u64,
    /// true tracks the maximum, false the minimum
    track_max: bool,
    deque: std::collections::VecDeque<(u64, rust_decimal::Decimal)>,
}

impl RollingExtremum {
    pub fn max(window: usize) -> Self {
        Self {
            window,
            next_index: 0,
            track_max: true,
            deque: std::collections::VecDeque::new(),
        }
    }

    pub fn min(window: usize) -> Self {
        Self {
            window,
            next_index: 0,
            track_max: false,
            deque: std::collections::VecDeque::new(),
        }
    }

    pub fn push(&mut self, value: rust_decimal::Decimal) {
        let index = self.next_index;
        self.next_index += 1;

        while let Some(&(_, back)) = self.deque.back() {
            let dominated = if self.track_max {
                back <= value
            } else {
                back >= value
            };
            if dominated {
                self.deque.pop_back();
            } else {
                break;
            }
        }
        self.deque.push_back((index, value));

        // Expire entries that fell out of the window.
        let cutoff = index.saturating_sub(self.window as u64 - 1);
        while let Some(&(front_index, _)) = self.deque.front() {
            if front_index < cutoff {
                self.deque.pop_front();
            } else {
                break;
            }
        }
    }

    /// Current extremum; `None` until at least one sample arrived.
    pub fn value(&self) -> Option<rust_decimal::Decimal> {
        self.deque.front().map(|&(_, v)| v)
    }

    /// Whether a full window of samples has been observed.
    pub fn is_saturated(&self) -> bool {
        self.next_index >= self.window as u64
    }

    pub fn reset(&mut self) {
        self.next_index = 0;
        self.deque.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rolling_max_tracks_window() {
        let mut ext = RollingExtremum::max(3);
        for v in [dec!(5), dec!(3), dec!(8), dec!(2), dec!(1)] {
            ext.push(v);
        }
        // Window is [8, 2, 1]
        assert_eq!(ext.value(), Some(dec!(8)));
        ext.push(dec!(1));
        // Window is [2, 1, 1]
        assert_eq!(ext.value(), Some(dec!(2)));
    }

    #[test]
    fn test_rolling_min_tracks_window() {
        let mut ext = RollingExtremum::min(3);
        for v in [dec!(5), dec!(3), dec!(8), dec!(9)] {
            ext.push(v);
        }
        assert_eq!(ext.value(), Some(dec!(3)));
        ext.push(dec!(10));
        // Window is [8, 9, 10]
        assert_eq!(ext.value(), Some(dec!(8)));
    }

    #[test]
    fn test_saturation() {
        let mut ext = RollingExtremum::max(2);
        assert!(!ext.is_saturated());
        ext.push(dec!(1));
        assert!(!ext.is_saturated());
        ext.push(dec!(2));
        assert!(ext.is_saturated());
    }
}
