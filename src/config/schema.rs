//! Declarative field schema for the configuration tree.
//!
//! Each field declares a type, optional bounds, and an enum domain where
//! applicable. Full validation runs every check and aggregates the
//! violations; partial validation covers runtime mutations, which may name
//! only some fields but may not name unknown sections or fields.

use super::EngineConfig;
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    Number,
    Integer,
    Boolean,
    Enumerated(&'static [&'static str]),
}

#[derive(Debug, Clone)]
pub struct FieldSpec {
    pub section: &'static str,
    pub name: &'static str,
    pub ty: FieldType,
    pub min: Option<f64>,
    pub max: Option<f64>,
    /// Bound is exclusive rather than inclusive.
    pub min_exclusive: bool,
    pub max_exclusive: bool,
}

impl FieldSpec {
    const fn number(section: &'static str, name: &'static str, min: f64, max: f64) -> Self {
        Self {
            section,
            name,
            ty: FieldType::Number,
            min: Some(min),
            max: Some(max),
            min_exclusive: false,
            max_exclusive: false,
        }
    }

    const fn number_exclusive(
        section: &'static str,
        name: &'static str,
        min: f64,
        max: f64,
    ) -> Self {
        Self {
            section,
            name,
            ty: FieldType::Number,
            min: Some(min),
            max: Some(max),
            min_exclusive: true,
            max_exclusive: true,
        }
    }

    const fn integer(section: &'static str, name: &'static str, min: f64, max: f64) -> Self {
        Self {
            section,
            name,
            ty: FieldType::Integer,
            min: Some(min),
            max: Some(max),
            min_exclusive: false,
            max_exclusive: false,
        }
    }

    const fn boolean(section: &'static str, name: &'static str) -> Self {
        Self {
            section,
            name,
            ty: FieldType::Boolean,
            min: None,
            max: None,
            min_exclusive: false,
            max_exclusive: false,
        }
    }

    const fn enumerated(
        section: &'static str,
        name: &'static str,
        domain: &'static [&'static str],
    ) -> Self {
        Self {
            section,
            name,
            ty: FieldType::Enumerated(domain),
            min: None,
            max: None,
            min_exclusive: false,
            max_exclusive: false,
        }
    }
}

const TRAILING_MODES: &[&str] = &["staircase", "atr", "dynamic"];

const SCHEMA: &[FieldSpec] = &[
    FieldSpec::number("trading", "initial_sl_roi", 0.01, 100.0),
    FieldSpec::number("trading", "initial_tp_roi", 0.01, 100.0),
    FieldSpec::number("trading", "break_even_buffer", 0.0, 10.0),
    FieldSpec::number_exclusive("trading", "trailing_step_percent", 0.0, 100.0),
    FieldSpec::number_exclusive("trading", "trailing_move_percent", 0.0, 100.0),
    FieldSpec::enumerated("trading", "trailing_mode", TRAILING_MODES),
    FieldSpec::number("trading", "slippage_buffer_percent", 0.0, 5.0),
    FieldSpec::number("trading", "position_size_percent", 0.01, 100.0),
    FieldSpec::integer("trading", "default_leverage", 1.0, 125.0),
    FieldSpec::integer("trading", "max_positions", 1.0, 100.0),
    FieldSpec::number("trading", "maker_fee", 0.0, 0.1),
    FieldSpec::number("trading", "taker_fee", 0.0, 0.1),
    FieldSpec::number("trading", "maintenance_margin_percent", 0.0, 10.0),
    FieldSpec::boolean("trading", "enable_partial_tp"),
    FieldSpec::integer("api", "retry_attempts", 0.0, 10.0),
    FieldSpec::integer("api", "retry_delay_ms", 0.0, 60_000.0),
    FieldSpec::integer("api", "request_timeout_ms", 100.0, 60_000.0),
    FieldSpec::integer("rate_limiter", "quota_per_window", 1.0, 1_000_000.0),
    FieldSpec::integer("rate_limiter", "window_ms", 1000.0, 600_000.0),
    FieldSpec::number("rate_limiter", "utilization_target_initial", 0.1, 1.0),
    FieldSpec::number("rate_limiter", "utilization_target_floor", 0.1, 1.0),
];

pub fn schema() -> &'static [FieldSpec] {
    SCHEMA
}

/// Aggregated validation failures, one message per violated field.
#[derive(Debug)]
pub struct ConfigErrors(pub Vec<String>);

impl fmt::Display for ConfigErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.join("; "))
    }
}

impl std::error::Error for ConfigErrors {}

fn numeric_value(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        // Decimal fields serialize as strings.
        Value::String(s) => s.parse::<f64>().ok(),
        _ => None,
    }
}

fn check_field(spec: &FieldSpec, value: &Value, errors: &mut Vec<String>) {
    let path = format!("{}.{}", spec.section, spec.name);
    match spec.ty {
        FieldType::Boolean => {
            if !value.is_boolean() {
                errors.push(format!("{}: expected a boolean", path));
            }
        }
        FieldType::Enumerated(domain) => match value.as_str() {
            Some(s) if domain.contains(&s) => {}
            Some(s) => errors.push(format!(
                "{}: '{}' is not one of {}",
                path,
                s,
                domain.join("|")
            )),
            None => errors.push(format!("{}: expected one of {}", path, domain.join("|"))),
        },
        FieldType::Number | FieldType::Integer => {
            let Some(n) = numeric_value(value) else {
                errors.push(format!("{}: expected a number", path));
                return;
            };
            if spec.ty == FieldType::Integer && n.fract() != 0.0 {
                errors.push(format!("{}: expected an integer", path));
            }
            if let Some(min) = spec.min {
                let violated = if spec.min_exclusive { n <= min } else { n < min };
                if violated {
                    let op = if spec.min_exclusive { ">" } else { ">=" };
                    errors.push(format!("{}: {} must be {} {}", path, n, op, min));
                }
            }
            if let Some(max) = spec.max {
                let violated = if spec.max_exclusive { n >= max } else { n > max };
                if violated {
                    let op = if spec.max_exclusive { "<" } else { "<=" };
                    errors.push(format!("{}: {} must be {} {}", path, n, op, max));
                }
            }
        }
    }
}

fn section_value(config: &EngineConfig, section: &str) -> Option<Value> {
    let value = match section {
        "trading" => serde_json::to_value(&config.trading),
        "api" => serde_json::to_value(&config.api),
        "rate_limiter" => serde_json::to_value(&config.rate_limiter),
        _ => return None,
    };
    value.ok()
}

/// Runs every schema check against the full tree, plus the cross-field
/// constraint tying the rate-limiter floor to its initial target.
pub fn validate_full(config: &EngineConfig) -> Result<(), ConfigErrors> {
    let mut errors = Vec::new();
    for spec in SCHEMA {
        let Some(section) = section_value(config, spec.section) else {
            errors.push(format!("{}: unknown section", spec.section));
            continue;
        };
        match section.get(spec.name) {
            Some(value) => check_field(spec, value, &mut errors),
            None => errors.push(format!("{}.{}: missing field", spec.section, spec.name)),
        }
    }

    if config.rate_limiter.utilization_target_floor > config.rate_limiter.utilization_target_initial
    {
        errors.push(format!(
            "rate_limiter.utilization_target_floor: {} exceeds the initial target {}",
            config.rate_limiter.utilization_target_floor,
            config.rate_limiter.utilization_target_initial
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigErrors(errors))
    }
}

/// Validates a runtime mutation. Only the supplied fields are checked, but
/// an unknown section or field name is always an error.
pub fn validate_partial(
    section: &str,
    patch: &serde_json::Map<String, Value>,
) -> Result<(), ConfigErrors> {
    let mut errors = Vec::new();
    let known_section = SCHEMA.iter().any(|spec| spec.section == section);
    if !known_section {
        return Err(ConfigErrors(vec![format!("{}: unknown section", section)]));
    }

    for (name, value) in patch {
        match SCHEMA
            .iter()
            .find(|spec| spec.section == section && spec.name == name)
        {
            Some(spec) => check_field(spec, value, &mut errors),
            None => errors.push(format!("{}.{}: unknown field", section, name)),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(ConfigErrors(errors))
    }
}
