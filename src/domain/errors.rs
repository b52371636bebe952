use rust_decimal::Decimal;
use thiserror::Error;

/// Engine-wide error taxonomy.
///
/// Infrastructure failures (network, rate limit) are recovered below the
/// position layer; trading-logic failures surface immediately and abort the
/// triggering operation. `InvariantViolation` must never be observable from
/// a healthy system.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid input: {context}")]
    InvalidInput { context: String },

    #[error("Invalid order ({field}): {reason}")]
    InvalidOrder { field: String, reason: String },

    #[error("Rate limited by exchange")]
    RateLimited,

    #[error("Transient network failure: {context}")]
    TransientNetwork { context: String },

    #[error("Stop replace failed in state {state}: {last_error}")]
    StopReplaceFailed { state: String, last_error: String },

    #[error("Insufficient margin: need ${required}, available ${available}")]
    InsufficientMargin {
        required: Decimal,
        available: Decimal,
    },

    #[error("Rate-limit quota exhausted and caller declined to wait")]
    QuotaExhausted,

    #[error("Invariant violation: {context}")]
    InvariantViolation { context: String },
}

impl EngineError {
    pub fn invalid_input(context: impl Into<String>) -> Self {
        EngineError::InvalidInput {
            context: context.into(),
        }
    }

    pub fn invalid_order(field: impl Into<String>, reason: impl Into<String>) -> Self {
        EngineError::InvalidOrder {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(context: impl Into<String>) -> Self {
        EngineError::TransientNetwork {
            context: context.into(),
        }
    }

    pub fn invariant(context: impl Into<String>) -> Self {
        EngineError::InvariantViolation {
            context: context.into(),
        }
    }

    /// Whether the error is worth retrying at the infrastructure layer.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TransientNetwork { .. } | EngineError::RateLimited
        )
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_insufficient_margin_formatting() {
        let err = EngineError::InsufficientMargin {
            required: dec!(120.50),
            available: dec!(100),
        };
        let msg = err.to_string();
        assert!(msg.contains("120.50"));
        assert!(msg.contains("100"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(EngineError::RateLimited.is_retryable());
        assert!(EngineError::transient("timeout").is_retryable());
        assert!(!EngineError::invalid_input("negative price").is_retryable());
        assert!(!EngineError::QuotaExhausted.is_retryable());
    }
}
