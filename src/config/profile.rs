//! Signal weight-profile catalog, loaded from a TOML file.
//!
//! Profiles arrive with plain floating-point numbers and are converted to
//! decimals at the boundary. A file may carry any number of named profiles;
//! each is validated (ordered thresholds) before it enters the catalog.

use crate::domain::errors::{EngineError, EngineResult};
use crate::domain::signal::{
    ClassThresholds, MomentumWeight, OscillatorWeight, SignalProfile, SlopeWeight, TrendWeight,
};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
struct RawOscillator {
    max: f64,
    oversold: f64,
    overbought: f64,
}

#[derive(Debug, Deserialize)]
struct RawMomentum {
    max: f64,
}

#[derive(Debug, Deserialize)]
struct RawSlope {
    max: f64,
    threshold: f64,
}

#[derive(Debug, Deserialize)]
struct RawTrend {
    max: f64,
    threshold: f64,
}

#[derive(Debug, Deserialize)]
struct RawThresholds {
    strong_buy: f64,
    buy: f64,
    buy_weak: f64,
    sell_weak: f64,
    sell: f64,
    strong_sell: f64,
}

#[derive(Debug, Deserialize)]
struct RawProfile {
    name: String,
    rsi: RawOscillator,
    williams_r: RawOscillator,
    kdj: RawOscillator,
    macd: RawMomentum,
    awesome: RawMomentum,
    obv: RawSlope,
    adx: RawTrend,
    thresholds: RawThresholds,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    #[serde(default)]
    profiles: Vec<RawProfile>,
}

fn dec(value: f64, field: &str) -> EngineResult<Decimal> {
    Decimal::from_f64(value)
        .ok_or_else(|| EngineError::invalid_input(format!("{}: {} is not representable", field, value)))
}

fn convert(raw: RawProfile) -> EngineResult<SignalProfile> {
    let profile = SignalProfile {
        name: raw.name,
        rsi: OscillatorWeight {
            max: dec(raw.rsi.max, "rsi.max")?,
            oversold: dec(raw.rsi.oversold, "rsi.oversold")?,
            overbought: dec(raw.rsi.overbought, "rsi.overbought")?,
        },
        williams_r: OscillatorWeight {
            max: dec(raw.williams_r.max, "williams_r.max")?,
            oversold: dec(raw.williams_r.oversold, "williams_r.oversold")?,
            overbought: dec(raw.williams_r.overbought, "williams_r.overbought")?,
        },
        kdj: OscillatorWeight {
            max: dec(raw.kdj.max, "kdj.max")?,
            oversold: dec(raw.kdj.oversold, "kdj.oversold")?,
            overbought: dec(raw.kdj.overbought, "kdj.overbought")?,
        },
        macd: MomentumWeight {
            max: dec(raw.macd.max, "macd.max")?,
        },
        awesome: MomentumWeight {
            max: dec(raw.awesome.max, "awesome.max")?,
        },
        obv: SlopeWeight {
            max: dec(raw.obv.max, "obv.max")?,
            threshold: dec(raw.obv.threshold, "obv.threshold")?,
        },
        adx: TrendWeight {
            max: dec(raw.adx.max, "adx.max")?,
            threshold: dec(raw.adx.threshold, "adx.threshold")?,
        },
        thresholds: ClassThresholds {
            strong_buy: dec(raw.thresholds.strong_buy, "thresholds.strong_buy")?,
            buy: dec(raw.thresholds.buy, "thresholds.buy")?,
            buy_weak: dec(raw.thresholds.buy_weak, "thresholds.buy_weak")?,
            sell_weak: dec(raw.thresholds.sell_weak, "thresholds.sell_weak")?,
            sell: dec(raw.thresholds.sell, "thresholds.sell")?,
            strong_sell: dec(raw.thresholds.strong_sell, "thresholds.strong_sell")?,
        },
    };
    profile.validate()?;
    Ok(profile)
}

/// Parses a profile catalog from TOML text.
pub fn parse_profiles(raw: &str) -> Result<Vec<SignalProfile>> {
    let file: ProfileFile = toml::from_str(raw).context("Failed to parse profile TOML")?;
    file.profiles
        .into_iter()
        .map(|p| {
            let name = p.name.clone();
            convert(p).map_err(|e| anyhow::anyhow!("Profile '{}': {}", name, e))
        })
        .collect()
}

/// Loads the catalog from disk; a missing path yields an empty catalog so
/// the generator falls back to its built-in default.
pub fn load_profiles(path: &Path) -> Result<Vec<SignalProfile>> {
    if !path.exists() {
        info!("No profile file at {:?}, using built-in default", path);
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path).context("Failed to read profile file")?;
    let profiles = parse_profiles(&raw)?;
    info!("Loaded {} signal profiles from {:?}", profiles.len(), path);
    Ok(profiles)
}
