use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Provider name used as the fallback key in the rate table.
pub const DEFAULT_PROVIDER: &str = "default";

pub const YFINANCE_RATE_LIMIT: f64 = 2.0;
pub const OPENAI_RATE_LIMIT: f64 = 10.0;
pub const DEFAULT_API_RATE_LIMIT: f64 = 1.0;
pub const API_THROTTLER_CAPACITY: u32 = 10;

/// Environment variables read by [`ThrottleConfig::from_env`].
pub const ENV_YFINANCE_RATE: &str = "YFINANCE_RATE_LIMIT";
pub const ENV_OPENAI_RATE: &str = "OPENAI_RATE_LIMIT";
pub const ENV_DEFAULT_RATE: &str = "DEFAULT_API_RATE_LIMIT";
pub const ENV_CAPACITY: &str = "API_THROTTLER_CAPACITY";

/// Rate limits (requests/second) per provider plus the shared bucket size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    #[serde(default = "default_capacity")]
    pub capacity: u32,
    #[serde(default = "default_rate")]
    pub default_rate: f64,
    #[serde(default = "default_rate_limits")]
    pub rate_limits: BTreeMap<String, f64>,
}

fn default_capacity() -> u32 {
    API_THROTTLER_CAPACITY
}

fn default_rate() -> f64 {
    DEFAULT_API_RATE_LIMIT
}

fn default_rate_limits() -> BTreeMap<String, f64> {
    BTreeMap::from([
        ("yfinance".to_string(), YFINANCE_RATE_LIMIT),
        ("openai".to_string(), OPENAI_RATE_LIMIT),
    ])
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            default_rate: default_rate(),
            rate_limits: default_rate_limits(),
        }
    }
}

impl ThrottleConfig {
    /// Builder-style override for a single provider's rate.
    pub fn with_rate(mut self, provider: &str, rate_per_sec: f64) -> Self {
        self.rate_limits.insert(provider.to_string(), rate_per_sec);
        self
    }

    pub fn with_capacity(mut self, capacity: u32) -> Self {
        self.capacity = capacity;
        self
    }

    /// Rate used for names missing from `rate_limits`. An explicit
    /// `"default"` entry in the table wins over `default_rate`.
    pub fn fallback_rate(&self) -> f64 {
        self.rate_limits
            .get(DEFAULT_PROVIDER)
            .copied()
            .unwrap_or(self.default_rate)
    }

    /// Reject zero capacity and non-positive or non-finite rates.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        check_rate(DEFAULT_PROVIDER, self.default_rate)?;
        for (provider, rate) in &self.rate_limits {
            check_rate(provider, *rate)?;
        }
        Ok(())
    }

    /// Defaults overlaid with the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with(|var| std::env::var(var).ok())
    }

    /// Defaults overlaid with values from `lookup`, keyed by env var name.
    pub fn from_env_with<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(rate) = parse_var(&lookup, ENV_YFINANCE_RATE)? {
            cfg.rate_limits.insert("yfinance".to_string(), rate);
        }
        if let Some(rate) = parse_var(&lookup, ENV_OPENAI_RATE)? {
            cfg.rate_limits.insert("openai".to_string(), rate);
        }
        if let Some(rate) = parse_var(&lookup, ENV_DEFAULT_RATE)? {
            cfg.default_rate = rate;
        }
        if let Some(capacity) = parse_var(&lookup, ENV_CAPACITY)? {
            cfg.capacity = capacity;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(raw: &str) -> anyhow::Result<Self> {
        let cfg: Self = serde_json::from_str(raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn json_schema() -> String {
        serde_json::to_string_pretty(&serde_json::json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "title": "API Throttle Configuration",
            "type": "object",
            "properties": {
                "capacity": {
                    "type": "integer",
                    "minimum": 1,
                    "default": API_THROTTLER_CAPACITY
                },
                "default_rate": {
                    "type": "number",
                    "exclusiveMinimum": 0,
                    "default": DEFAULT_API_RATE_LIMIT
                },
                "rate_limits": {
                    "type": "object",
                    "additionalProperties": { "type": "number", "exclusiveMinimum": 0 },
                    "default": {
                        "yfinance": YFINANCE_RATE_LIMIT,
                        "openai": OPENAI_RATE_LIMIT
                    }
                }
            }
        }))
        .unwrap_or_default()
    }
}

fn check_rate(provider: &str, rate: f64) -> Result<(), ConfigError> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(ConfigError::NonPositiveRate {
            provider: provider.to_string(),
            rate,
        })
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
) -> Result<Option<T>, ConfigError> {
    match lookup(var) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnvValue {
                var: var.to_string(),
                value: raw,
            }),
    }
}
