//! Error types for the throttle and its configuration.

use std::time::Duration;

/// Returned when a scoped acquisition could not obtain a token in time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ThrottleError {
    #[error(
        "could not acquire token for '{provider}' within {:.3}s",
        .timeout.as_secs_f64()
    )]
    Timeout { provider: String, timeout: Duration },
}

impl ThrottleError {
    /// Provider the failed acquisition was for.
    pub fn provider(&self) -> &str {
        match self {
            ThrottleError::Timeout { provider, .. } => provider,
        }
    }
}

/// Rejected configuration. Only ever produced at construction time.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("rate for provider '{provider}' must be a positive number, got {rate}")]
    NonPositiveRate { provider: String, rate: f64 },

    #[error("bucket capacity must be at least 1")]
    ZeroCapacity,

    #[error("environment variable {var} has invalid value '{value}'")]
    InvalidEnvValue { var: String, value: String },
}
