//! Weighted composite signal scoring.
//!
//! Each indicator contributes a signed number of points bounded by the
//! profile's per-indicator maximum; the sum maps through ordered thresholds
//! to a signal class. Profiles are swapped atomically: a generation call
//! observes exactly one profile.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::indicators::{
    Adx, AwesomeOscillator, Indicator, Kdj, KdjOutput, Macd, MacdOutput, Obv, Rsi, WilliamsR,
};
use crate::domain::types::Candle;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, RwLock};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalClass {
    StrongBuy,
    Buy,
    Neutral,
    Sell,
    StrongSell,
}

/// Oscillator weight: points plus the band edges that earn them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OscillatorWeight {
    pub max: Decimal,
    pub oversold: Decimal,
    pub overbought: Decimal,
}

/// Momentum weight: direction-only contribution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumWeight {
    pub max: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlopeWeight {
    pub max: Decimal,
    /// Minimum absolute slope before any points are granted.
    pub threshold: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrendWeight {
    pub max: Decimal,
    /// ADX level above which the trend direction earns points.
    pub threshold: Decimal,
}

/// Ordered class thresholds. Must satisfy
/// strong_buy > buy > buy_weak > 0 > sell_weak > sell > strong_sell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassThresholds {
    pub strong_buy: Decimal,
    pub buy: Decimal,
    pub buy_weak: Decimal,
    pub sell_weak: Decimal,
    pub sell: Decimal,
    pub strong_sell: Decimal,
}

impl ClassThresholds {
    pub fn validate(&self) -> EngineResult<()> {
        let ordered = self.strong_buy > self.buy
            && self.buy > self.buy_weak
            && self.buy_weak > Decimal::ZERO
            && Decimal::ZERO > self.sell_weak
            && self.sell_weak > self.sell
            && self.sell > self.strong_sell;
        if !ordered {
            return Err(EngineError::invalid_input(
                "signal class thresholds must be strictly ordered",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalProfile {
    pub name: String,
    pub rsi: OscillatorWeight,
    pub williams_r: OscillatorWeight,
    pub kdj: OscillatorWeight,
    pub macd: MomentumWeight,
    pub awesome: MomentumWeight,
    pub obv: SlopeWeight,
    pub adx: TrendWeight,
    pub thresholds: ClassThresholds,
}

impl SignalProfile {
    pub fn validate(&self) -> EngineResult<()> {
        self.thresholds.validate()
    }
}

impl Default for SignalProfile {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            rsi: OscillatorWeight {
                max: Decimal::from(25),
                oversold: Decimal::from(30),
                overbought: Decimal::from(70),
            },
            williams_r: OscillatorWeight {
                max: Decimal::from(15),
                oversold: Decimal::from(-80),
                overbought: Decimal::from(-20),
            },
            kdj: OscillatorWeight {
                max: Decimal::from(15),
                oversold: Decimal::from(20),
                overbought: Decimal::from(80),
            },
            macd: MomentumWeight {
                max: Decimal::from(20),
            },
            awesome: MomentumWeight {
                max: Decimal::from(10),
            },
            obv: SlopeWeight {
                max: Decimal::from(10),
                threshold: Decimal::new(5, 2),
            },
            adx: TrendWeight {
                max: Decimal::from(5),
                threshold: Decimal::from(25),
            },
            thresholds: ClassThresholds {
                strong_buy: Decimal::from(60),
                buy: Decimal::from(35),
                buy_weak: Decimal::from(15),
                sell_weak: Decimal::from(-15),
                sell: Decimal::from(-35),
                strong_sell: Decimal::from(-60),
            },
        }
    }
}

/// Latest output of every engine, `None` while warming up.
#[derive(Debug, Clone, Default)]
pub struct IndicatorReadings {
    pub rsi: Option<Decimal>,
    pub macd: Option<MacdOutput>,
    pub awesome: Option<Decimal>,
    pub williams_r: Option<Decimal>,
    pub kdj: Option<KdjOutput>,
    pub obv_slope: Option<Decimal>,
    pub adx: Option<Decimal>,
    pub directional: Option<(Decimal, Decimal)>,
}

/// One indicator's contribution to the composite score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreComponent {
    #[serde(skip_deserializing)]
    pub indicator: &'static str,
    pub points: Decimal,
    pub max: Decimal,
    pub available: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub profile: String,
    pub score: Decimal,
    pub class: SignalClass,
    pub breakdown: Vec<ScoreComponent>,
}

/// Band-based oscillator score: points grow linearly as the reading moves
/// deeper past the oversold (bullish) or overbought (bearish) edge.
fn oscillator_points(
    value: Decimal,
    weight: &OscillatorWeight,
    floor: Decimal,
    ceiling: Decimal,
) -> Decimal {
    if value <= weight.oversold {
        let span = weight.oversold - floor;
        if span <= Decimal::ZERO {
            return weight.max;
        }
        ((weight.oversold - value) / span * weight.max).min(weight.max)
    } else if value >= weight.overbought {
        let span = ceiling - weight.overbought;
        if span <= Decimal::ZERO {
            return -weight.max;
        }
        (-((value - weight.overbought) / span * weight.max)).max(-weight.max)
    } else {
        Decimal::ZERO
    }
}

fn sign_points(value: Decimal, weight: &MomentumWeight) -> Decimal {
    if value > Decimal::ZERO {
        weight.max
    } else if value < Decimal::ZERO {
        -weight.max
    } else {
        Decimal::ZERO
    }
}

pub struct SignalGenerator {
    profile: RwLock<Arc<SignalProfile>>,
}

impl SignalGenerator {
    pub fn new(profile: SignalProfile) -> EngineResult<Self> {
        profile.validate()?;
        Ok(Self {
            profile: RwLock::new(Arc::new(profile)),
        })
    }

    /// Falls back to the built-in default when `requested` is absent.
    pub fn from_catalog(catalog: &[SignalProfile], requested: &str) -> Self {
        let profile = catalog
            .iter()
            .find(|p| p.name == requested)
            .cloned()
            .unwrap_or_else(|| {
                warn!(
                    "Signal profile '{}' not found, falling back to default",
                    requested
                );
                SignalProfile::default()
            });
        Self {
            profile: RwLock::new(Arc::new(profile)),
        }
    }

    /// Atomically replace the active profile.
    pub fn switch_profile(&self, profile: SignalProfile) -> EngineResult<()> {
        profile.validate()?;
        let mut guard = self.profile.write().expect("profile lock poisoned");
        *guard = Arc::new(profile);
        Ok(())
    }

    pub fn active_profile_name(&self) -> String {
        self.profile
            .read()
            .expect("profile lock poisoned")
            .name
            .clone()
    }

    pub fn generate(&self, readings: &IndicatorReadings) -> Signal {
        // One clone per call: the whole evaluation sees a single profile.
        let profile = self.profile.read().expect("profile lock poisoned").clone();

        let mut breakdown = Vec::with_capacity(7);
        let mut push = |indicator: &'static str, max: Decimal, points: Option<Decimal>| {
            breakdown.push(ScoreComponent {
                indicator,
                points: points.unwrap_or(Decimal::ZERO),
                max,
                available: points.is_some(),
            });
        };

        push(
            "rsi",
            profile.rsi.max,
            readings
                .rsi
                .map(|v| oscillator_points(v, &profile.rsi, Decimal::ZERO, Decimal::ONE_HUNDRED)),
        );
        push(
            "williams_r",
            profile.williams_r.max,
            readings.williams_r.map(|v| {
                oscillator_points(
                    v,
                    &profile.williams_r,
                    Decimal::from(-100),
                    Decimal::ZERO,
                )
            }),
        );
        push(
            "kdj",
            profile.kdj.max,
            readings
                .kdj
                .map(|v| oscillator_points(v.j, &profile.kdj, Decimal::ZERO, Decimal::ONE_HUNDRED)),
        );
        push(
            "macd",
            profile.macd.max,
            readings.macd.map(|v| sign_points(v.histogram, &profile.macd)),
        );
        push(
            "awesome",
            profile.awesome.max,
            readings.awesome.map(|v| sign_points(v, &profile.awesome)),
        );
        push(
            "obv",
            profile.obv.max,
            readings.obv_slope.map(|slope| {
                if slope >= profile.obv.threshold {
                    profile.obv.max
                } else if slope <= -profile.obv.threshold {
                    -profile.obv.max
                } else {
                    Decimal::ZERO
                }
            }),
        );
        push(
            "adx",
            profile.adx.max,
            readings.adx.map(|adx| {
                if adx < profile.adx.threshold {
                    return Decimal::ZERO;
                }
                match readings.directional {
                    Some((plus_di, minus_di)) if plus_di > minus_di => profile.adx.max,
                    Some((plus_di, minus_di)) if plus_di < minus_di => -profile.adx.max,
                    _ => Decimal::ZERO,
                }
            }),
        );

        let score: Decimal = breakdown.iter().map(|c| c.points).sum();
        let class = classify(score, &profile.thresholds);

        Signal {
            profile: profile.name.clone(),
            score,
            class,
            breakdown,
        }
    }
}

fn classify(score: Decimal, t: &ClassThresholds) -> SignalClass {
    if score >= t.strong_buy {
        SignalClass::StrongBuy
    } else if score >= t.buy {
        SignalClass::Buy
    } else if score <= t.strong_sell {
        SignalClass::StrongSell
    } else if score <= t.sell {
        SignalClass::Sell
    } else {
        SignalClass::Neutral
    }
}

/// Owns one engine of each kind for a single `(symbol, timeframe)` stream and
/// exposes the latest readings for scoring.
pub struct IndicatorBank {
    rsi: Rsi,
    macd: Macd,
    awesome: AwesomeOscillator,
    williams_r: WilliamsR,
    kdj: Kdj,
    obv: Obv,
    adx: Adx,
}

impl IndicatorBank {
    pub fn new() -> Self {
        Self {
            rsi: Rsi::new(14),
            macd: Macd::new(12, 26, 9),
            awesome: AwesomeOscillator::new(),
            williams_r: WilliamsR::new(14),
            kdj: Kdj::new(9, 3, 3),
            obv: Obv::with_smoothing(10, 5),
            adx: Adx::new(14),
        }
    }

    pub fn update(&mut self, candle: &Candle) {
        for engine in self.engines_mut() {
            engine.update(candle);
        }
    }

    pub fn readings(&self) -> IndicatorReadings {
        IndicatorReadings {
            rsi: self.rsi.value(),
            macd: self.macd.value(),
            awesome: self.awesome.value(),
            williams_r: self.williams_r.value(),
            kdj: self.kdj.value(),
            obv_slope: self.obv.slope(),
            adx: self.adx.value(),
            directional: self.adx.directional_indexes(),
        }
    }

    pub fn reset(&mut self) {
        for engine in self.engines_mut() {
            engine.reset();
        }
    }

    /// Serialized state of every engine, keyed by engine name.
    pub fn snapshot(&self) -> serde_json::Value {
        let mut map = serde_json::Map::new();
        for engine in self.engines() {
            map.insert(engine.name().to_string(), engine.snapshot());
        }
        serde_json::Value::Object(map)
    }

    pub fn restore(&mut self, state: &serde_json::Value) -> EngineResult<()> {
        let map = state
            .as_object()
            .ok_or_else(|| EngineError::invalid_input("indicator snapshot must be an object"))?;
        for engine in self.engines_mut() {
            let entry = map.get(engine.name()).ok_or_else(|| {
                EngineError::invalid_input(format!("snapshot missing engine '{}'", engine.name()))
            })?;
            engine.restore(entry)?;
        }
        Ok(())
    }

    fn engines(&self) -> [&dyn Indicator; 7] {
        [
            &self.rsi,
            &self.macd,
            &self.awesome,
            &self.williams_r,
            &self.kdj,
            &self.obv,
            &self.adx,
        ]
    }

    fn engines_mut(&mut self) -> [&mut dyn Indicator; 7] {
        [
            &mut self.rsi,
            &mut self.macd,
            &mut self.awesome,
            &mut self.williams_r,
            &mut self.kdj,
            &mut self.obv,
            &mut self.adx,
        ]
    }
}

impl Default for IndicatorBank {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn readings_with_rsi(rsi: Decimal) -> IndicatorReadings {
        IndicatorReadings {
            rsi: Some(rsi),
            ..Default::default()
        }
    }

    #[test]
    fn test_contribution_bounded_by_max() {
        let generator = SignalGenerator::new(SignalProfile::default()).unwrap();
        let signal = generator.generate(&readings_with_rsi(dec!(0)));
        let rsi = signal.breakdown.iter().find(|c| c.indicator == "rsi").unwrap();
        assert_eq!(rsi.points, dec!(25));

        let signal = generator.generate(&readings_with_rsi(dec!(100)));
        let rsi = signal.breakdown.iter().find(|c| c.indicator == "rsi").unwrap();
        assert_eq!(rsi.points, dec!(-25));
    }

    #[test]
    fn test_neutral_band_scores_zero() {
        let generator = SignalGenerator::new(SignalProfile::default()).unwrap();
        let signal = generator.generate(&readings_with_rsi(dec!(50)));
        assert_eq!(signal.score, dec!(0));
        assert_eq!(signal.class, SignalClass::Neutral);
    }

    #[test]
    fn test_warm_up_marks_unavailable() {
        let generator = SignalGenerator::new(SignalProfile::default()).unwrap();
        let signal = generator.generate(&IndicatorReadings::default());
        assert!(signal.breakdown.iter().all(|c| !c.available));
        assert_eq!(signal.score, dec!(0));
    }

    #[test]
    fn test_composite_classification() {
        let generator = SignalGenerator::new(SignalProfile::default()).unwrap();
        let readings = IndicatorReadings {
            rsi: Some(dec!(15)),
            macd: Some(MacdOutput {
                macd: dec!(1),
                signal: dec!(0.5),
                histogram: dec!(0.5),
            }),
            awesome: Some(dec!(2)),
            williams_r: Some(dec!(-90)),
            kdj: None,
            obv_slope: Some(dec!(0.2)),
            adx: Some(dec!(30)),
            directional: Some((dec!(28), dec!(12))),
        };
        let signal = generator.generate(&readings);
        // rsi 12.5 + macd 20 + ao 10 + w%r 7.5 + obv 10 + adx 5 = 65
        assert_eq!(signal.score, dec!(65));
        assert_eq!(signal.class, SignalClass::StrongBuy);
    }

    #[test]
    fn test_missing_profile_falls_back_to_default() {
        let generator = SignalGenerator::from_catalog(&[], "aggressive");
        assert_eq!(generator.active_profile_name(), "default");
    }

    #[test]
    fn test_unordered_thresholds_rejected() {
        let mut profile = SignalProfile::default();
        profile.thresholds.buy = profile.thresholds.strong_buy;
        assert!(SignalGenerator::new(profile).is_err());
    }

    #[test]
    fn test_profile_switch_is_atomic() {
        let generator = SignalGenerator::new(SignalProfile::default()).unwrap();
        let mut aggressive = SignalProfile::default();
        aggressive.name = "aggressive".to_string();
        aggressive.rsi.max = dec!(50);
        generator.switch_profile(aggressive).unwrap();

        let signal = generator.generate(&readings_with_rsi(dec!(0)));
        assert_eq!(signal.profile, "aggressive");
        let rsi = signal.breakdown.iter().find(|c| c.indicator == "rsi").unwrap();
        assert_eq!(rsi.points, dec!(50));
    }

    #[test]
    fn test_bank_snapshot_round_trip() {
        let mut live = IndicatorBank::new();
        for i in 0..60i64 {
            let base = Decimal::from(100 + (i * 7) % 31);
            live.update(&Candle {
                timestamp: i * 60_000,
                open: base,
                high: base + dec!(2),
                low: base - dec!(2),
                close: base + dec!(1),
                volume: dec!(100),
            });
        }
        let snap = live.snapshot();

        let mut restored = IndicatorBank::new();
        restored.restore(&snap).unwrap();
        let next = Candle {
            timestamp: 61 * 60_000,
            open: dec!(120),
            high: dec!(124),
            low: dec!(119),
            close: dec!(123),
            volume: dec!(250),
        };
        live.update(&next);
        restored.update(&next);

        let a = live.readings();
        let b = restored.readings();
        assert_eq!(a.rsi, b.rsi);
        assert_eq!(a.macd, b.macd);
        assert_eq!(a.kdj, b.kdj);
        assert_eq!(a.adx, b.adx);
        assert_eq!(a.obv_slope, b.obv_slope);
    }
}
