//! Error types for the Turnstile crate.

use thiserror::Error;

/// Main error type for Turnstile operations.
///
/// Every variant is raised while loading or validating configuration; request
/// evaluation itself never fails.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A quota string that does not follow `<count>/<unit>`
    #[error("Invalid quota '{input}': {reason}")]
    InvalidQuota {
        /// The offending input
        input: String,
        /// Why it was rejected
        reason: String,
    },

    /// A key resolver name with no registered implementation
    #[error("Unknown key resolver: {0}")]
    UnknownResolver(String),

    /// Layered service settings could not be assembled
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// YAML limit configuration could not be parsed
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON limit configuration could not be parsed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TurnstileError {
    pub(crate) fn invalid_quota(input: &str, reason: impl Into<String>) -> Self {
        TurnstileError::InvalidQuota {
            input: input.to_string(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;
