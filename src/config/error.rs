//! Configuration error types

use thiserror::Error;

/// Errors that can occur during configuration loading
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration loading failed: {0}")]
    LoadError(#[from] config::ConfigError),

    #[error("Validation failed: {0}")]
    ValidationFailed(#[from] ValidationError),
}

/// Errors that can occur during configuration validation
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required configuration missing: {0}")]
    MissingRequired(&'static str),

    #[error("Invalid ledger API key format")]
    InvalidLedgerKey,

    #[error("Ledger base URL must be http(s)")]
    InvalidBaseUrl,

    #[error("{0} must be greater than zero")]
    MustBePositive(&'static str),

    #[error("Backoff base delay exceeds its cap")]
    InvalidBackoff,

    #[error("Invalid log filter: {0}")]
    InvalidLogFilter(String),
}
