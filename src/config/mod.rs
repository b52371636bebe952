//! Engine configuration: env-driven loading plus a total schema validator.
//!
//! Every field carries a declared type, bounds, and default. `validate`
//! checks the whole tree and aggregates every violation instead of stopping
//! at the first; `validate_partial` checks a runtime mutation and rejects
//! unknown section or field names outright.

pub mod profile;
mod schema;

pub use schema::{ConfigErrors, FieldSpec, FieldType, schema, validate_partial};

use crate::domain::trailing::{TrailingConfig, TrailingMode};
use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingSettings {
    pub initial_sl_roi: Decimal,
    pub initial_tp_roi: Decimal,
    pub break_even_buffer: Decimal,
    pub trailing_step_percent: Decimal,
    pub trailing_move_percent: Decimal,
    pub trailing_mode: TrailingMode,
    pub slippage_buffer_percent: Decimal,
    pub position_size_percent: Decimal,
    pub default_leverage: u32,
    pub max_positions: u32,
    pub maker_fee: Decimal,
    pub taker_fee: Decimal,
    pub maintenance_margin_percent: Decimal,
    pub enable_partial_tp: bool,
}

impl Default for TradingSettings {
    fn default() -> Self {
        Self {
            initial_sl_roi: Decimal::new(5, 1),            // 0.5
            initial_tp_roi: Decimal::TWO,                  // 2.0
            break_even_buffer: Decimal::new(1, 1),         // 0.1
            trailing_step_percent: Decimal::new(15, 2),    // 0.15
            trailing_move_percent: Decimal::new(5, 2),     // 0.05
            trailing_mode: TrailingMode::Staircase,
            slippage_buffer_percent: Decimal::new(2, 2),   // 0.02
            position_size_percent: Decimal::new(5, 1),     // 0.5
            default_leverage: 10,
            max_positions: 5,
            maker_fee: Decimal::new(2, 4),                 // 0.0002
            taker_fee: Decimal::new(6, 4),                 // 0.0006
            maintenance_margin_percent: Decimal::new(5, 1),
            enable_partial_tp: false,
        }
    }
}

impl TradingSettings {
    pub fn trailing(&self) -> TrailingConfig {
        TrailingConfig {
            break_even_buffer: self.break_even_buffer,
            trailing_step_percent: self.trailing_step_percent,
            trailing_move_percent: self.trailing_move_percent,
            trailing_mode: self.trailing_mode,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSettings {
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub request_timeout_ms: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            retry_attempts: 3,
            retry_delay_ms: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterSettings {
    pub quota_per_window: u32,
    pub window_ms: u64,
    pub utilization_target_initial: f64,
    pub utilization_target_floor: f64,
}

impl Default for RateLimiterSettings {
    fn default() -> Self {
        Self {
            quota_per_window: 2000,
            window_ms: 30_000,
            utilization_target_initial: 0.70,
            utilization_target_floor: 0.40,
        }
    }
}

/// Full engine configuration tree.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    pub trading: TradingSettings,
    pub api: ApiSettings,
    pub rate_limiter: RateLimiterSettings,
    #[serde(default)]
    pub process: ProcessSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSettings {
    pub demo_mode: bool,
    pub listen_port: u16,
    pub state_path: String,
    pub symbols: Vec<String>,
    pub signal_profile: String,
    pub profiles_path: Option<String>,
    pub reconcile_interval_secs: u64,
}

impl Default for ProcessSettings {
    fn default() -> Self {
        Self {
            demo_mode: true,
            listen_port: 8720,
            state_path: "data/engine-state.json".to_string(),
            symbols: vec!["XBTUSDTM".to_string()],
            signal_profile: "default".to_string(),
            profiles_path: None,
            reconcile_interval_secs: 30,
        }
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Invalid {}: {}", key, e)),
        Err(_) => Ok(default),
    }
}

impl EngineConfig {
    /// Loads from environment variables, validating the assembled tree.
    /// Credentials are read separately by the transport layer and never
    /// stored here.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let trading = TradingSettings {
            initial_sl_roi: env_parse("INITIAL_SL_ROI", defaults.trading.initial_sl_roi)?,
            initial_tp_roi: env_parse("INITIAL_TP_ROI", defaults.trading.initial_tp_roi)?,
            break_even_buffer: env_parse("BREAK_EVEN_BUFFER", defaults.trading.break_even_buffer)?,
            trailing_step_percent: env_parse(
                "TRAILING_STEP_PERCENT",
                defaults.trading.trailing_step_percent,
            )?,
            trailing_move_percent: env_parse(
                "TRAILING_MOVE_PERCENT",
                defaults.trading.trailing_move_percent,
            )?,
            trailing_mode: match env::var("TRAILING_MODE") {
                Ok(raw) => match raw.to_lowercase().as_str() {
                    "staircase" => TrailingMode::Staircase,
                    "atr" => TrailingMode::Atr,
                    "dynamic" => TrailingMode::Dynamic,
                    other => anyhow::bail!("Invalid TRAILING_MODE: {}", other),
                },
                Err(_) => defaults.trading.trailing_mode,
            },
            slippage_buffer_percent: env_parse(
                "SLIPPAGE_BUFFER_PERCENT",
                defaults.trading.slippage_buffer_percent,
            )?,
            position_size_percent: env_parse(
                "POSITION_SIZE_PERCENT",
                defaults.trading.position_size_percent,
            )?,
            default_leverage: env_parse("DEFAULT_LEVERAGE", defaults.trading.default_leverage)?,
            max_positions: env_parse("MAX_POSITIONS", defaults.trading.max_positions)?,
            maker_fee: env_parse("MAKER_FEE", defaults.trading.maker_fee)?,
            taker_fee: env_parse("TAKER_FEE", defaults.trading.taker_fee)?,
            maintenance_margin_percent: env_parse(
                "MAINTENANCE_MARGIN_PERCENT",
                defaults.trading.maintenance_margin_percent,
            )?,
            enable_partial_tp: env_parse("ENABLE_PARTIAL_TP", defaults.trading.enable_partial_tp)?,
        };

        let api = ApiSettings {
            retry_attempts: env_parse("API_RETRY_ATTEMPTS", defaults.api.retry_attempts)?,
            retry_delay_ms: env_parse("API_RETRY_DELAY_MS", defaults.api.retry_delay_ms)?,
            request_timeout_ms: env_parse("API_REQUEST_TIMEOUT_MS", defaults.api.request_timeout_ms)?,
        };

        let rate_limiter = RateLimiterSettings {
            quota_per_window: env_parse("RL_QUOTA_PER_WINDOW", defaults.rate_limiter.quota_per_window)?,
            window_ms: env_parse("RL_WINDOW_MS", defaults.rate_limiter.window_ms)?,
            utilization_target_initial: env_parse(
                "RL_UTILIZATION_INITIAL",
                defaults.rate_limiter.utilization_target_initial,
            )?,
            utilization_target_floor: env_parse(
                "RL_UTILIZATION_FLOOR",
                defaults.rate_limiter.utilization_target_floor,
            )?,
        };

        let process = ProcessSettings {
            demo_mode: env_parse("DEMO_MODE", defaults.process.demo_mode)?,
            listen_port: env_parse("LISTEN_PORT", defaults.process.listen_port)?,
            state_path: env::var("STATE_PATH").unwrap_or(defaults.process.state_path),
            symbols: match env::var("SYMBOLS") {
                Ok(raw) => raw.split(',').map(|s| s.trim().to_string()).collect(),
                Err(_) => defaults.process.symbols,
            },
            signal_profile: env::var("SIGNAL_PROFILE").unwrap_or(defaults.process.signal_profile),
            profiles_path: env::var("PROFILES_PATH").ok(),
            reconcile_interval_secs: env_parse(
                "RECONCILE_INTERVAL_SECS",
                defaults.process.reconcile_interval_secs,
            )?,
        };

        let config = Self {
            trading,
            api,
            rate_limiter,
            process,
        };
        config
            .validate()
            .map_err(|e| anyhow::anyhow!(e.to_string()))
            .context("Configuration failed schema validation")?;
        Ok(config)
    }

    /// Total validation: every field is checked and every violation is
    /// reported.
    pub fn validate(&self) -> Result<(), ConfigErrors> {
        schema::validate_full(self)
    }
}
