//! Per-provider token-bucket admission control for outbound API calls.
//!
//! Build one [`throttle::ApiThrottler`] at startup, share it as an `Arc`, and
//! wrap each outbound call in [`throttle::ApiThrottler::throttle`] (or one
//! of its async/closure forms).

pub mod config;
pub mod error;
pub mod gateway;
pub mod provider;
pub mod telemetry;
pub mod throttle;

pub use config::ThrottleConfig;
pub use error::{ConfigError, ThrottleError};
pub use throttle::{ApiThrottler, ThrottlePermit};
