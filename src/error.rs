//! Crate-level error types.
//!
//! [`MeterError`] covers bootstrap, configuration and administrative
//! failures. Per-call proxy failures use the narrower
//! [`ProxyError`](crate::proxy::ProxyError) taxonomy, which maps onto HTTP
//! status codes.

use thiserror::Error;

use crate::store::StoreError;

/// Errors raised outside the per-call proxy pipeline.
#[derive(Error, Debug)]
pub enum MeterError {
    /// Configuration is missing or invalid.
    #[error("Config error: {0}")]
    Config(String),

    /// Listener setup or serve loop failed.
    #[error("Server error: {0}")]
    Server(String),

    /// Usage ledger operation failed.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// HTTP client construction failed.
    #[error("Network error: {0}")]
    Network(String),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for gpt-meter operations
pub type Result<T> = std::result::Result<T, MeterError>;

impl From<reqwest::Error> for MeterError {
    fn from(err: reqwest::Error) -> Self {
        MeterError::Network(err.to_string())
    }
}

impl From<toml::de::Error> for MeterError {
    fn from(err: toml::de::Error) -> Self {
        MeterError::Config(err.to_string())
    }
}
