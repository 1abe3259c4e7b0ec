//! Custom error types for answerbank

use thiserror::Error;

/// Main error type for answerbank operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    /// The storage backend could not be reached. Fatal to the current operation.
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Database error: {0}")]
    Database(String),

    /// Stored vector data is corrupted or inconsistent with its version.
    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Vector encode/decode failure. Treated as corruption by callers.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A single malformed record or source entry.
    #[error("Validation error for '{entry_id}': {reason}")]
    Validation { entry_id: String, reason: String },

    #[error("Embedding provider error: {message}")]
    Provider { message: String, retryable: bool },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Not initialized: run 'answerbank init' first")]
    NotInitialized,

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn validation(entry_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Validation {
            entry_id: entry_id.into(),
            reason: reason.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Error::Provider {
            message: message.into(),
            retryable: false,
        }
    }

    /// Whether a retry of the same operation may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { retryable, .. } => *retryable,
            Error::Connection(_) => true,
            _ => false,
        }
    }
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                Error::Connection(err.to_string())
            }
            sqlx::Error::Io(_) | sqlx::Error::Tls(_) => Error::Connection(err.to_string()),
            sqlx::Error::RowNotFound => Error::NotFound(err.to_string()),
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
                Error::Serialization(err.to_string())
            }
            other => Error::Database(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for answerbank
pub type Result<T> = std::result::Result<T, Error>;
