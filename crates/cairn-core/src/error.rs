//! Error types for Cairn

use std::time::Duration;

use thiserror::Error;

/// Result type alias using Cairn's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Cairn error types with helpful messages and suggestions
#[derive(Error, Debug)]
pub enum Error {
    // Routing errors (E100-E199)
    #[error("No backends available: {0}")]
    NoBackendsAvailable(String),

    #[error("Unknown backend '{0}'. It is not part of the configured roster.")]
    UnknownBackend(String),

    // Config errors (E200-E299)
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Settings error: {0}")]
    Settings(String),

    // Persistence errors (E300-E399)
    #[error("Failed to persist {target}: {message}")]
    PersistenceFailure {
        target: &'static str,
        message: String,
    },

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Protocol errors (E400-E499)
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("Server error {code}: {message}")]
    Remote { code: String, message: String },

    // Input errors (E800-E899)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // Generic errors
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Build a persistence failure for the given target (e.g. "routing config")
    pub fn persistence(target: &'static str, err: impl std::fmt::Display) -> Self {
        Self::PersistenceFailure {
            target,
            message: err.to_string(),
        }
    }

    /// Get error code for this error type
    pub fn code(&self) -> &'static str {
        match self {
            Self::NoBackendsAvailable(_) => "E100",
            Self::UnknownBackend(_) => "E101",
            Self::InvalidConfiguration(_) => "E200",
            Self::Settings(_) => "E201",
            Self::PersistenceFailure { .. } => "E300",
            Self::Database(_) => "E301",
            Self::Serialization(_) => "E302",
            Self::ProtocolError(_) => "E400",
            Self::ConnectionTimeout(_) => "E401",
            Self::Remote { .. } => "E402",
            Self::InvalidInput(_) => "E800",
            Self::Io(_) => "E9999",
        }
    }

    /// Get suggestion for how to fix this error
    pub fn suggestion(&self) -> Option<String> {
        match self {
            Self::NoBackendsAvailable(_) => {
                Some("cairn config show (check `backends` and the requested filter)".to_string())
            }
            Self::UnknownBackend(id) => Some(format!(
                "add '{}' to `backends` in the routing config or fix the reporting caller",
                id
            )),
            Self::InvalidConfiguration(_) => Some("cairn config show".to_string()),
            Self::ConnectionTimeout(_) => Some("check that `cairn serve` is running".to_string()),
            _ => None,
        }
    }

    /// Whether this error is a request-path failure the caller can fix and retry
    pub fn is_request_error(&self) -> bool {
        matches!(
            self,
            Self::NoBackendsAvailable(_)
                | Self::UnknownBackend(_)
                | Self::InvalidConfiguration(_)
                | Self::InvalidInput(_)
        )
    }
}
