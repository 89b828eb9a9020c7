//! Error types for the sink
//!
//! Configuration errors, schema construction included, reject startup.
//! Everything else surfaces from `format_batch` or `deliver` and is
//! classified by the delivery pipeline.

use bqsink_common::CommonError;
use thiserror::Error;

/// Result type alias for sink operations
pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Error, Debug)]
pub enum SinkError {
    /// Invalid or inconsistent configuration; fatal at startup
    #[error("Configuration error: {0}")]
    Config(String),

    /// A record could not be coerced against the schema
    #[error("Format error: {0}")]
    Format(String),

    /// A persisted chunk could not be framed or decoded
    #[error("Codec error: {0}")]
    Codec(String),

    /// Access token could not be obtained
    #[error("Authorization error: {0}")]
    Auth(String),

    /// The request never produced a response (connect, timeout, TLS)
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote store answered with a non-success response
    #[error("{operation} failed with code {code}: {message}")]
    Remote {
        operation: &'static str,
        code: u16,
        message: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SinkError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn format(msg: impl Into<String>) -> Self {
        Self::Format(msg.into())
    }

    pub fn codec(msg: impl Into<String>) -> Self {
        Self::Codec(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    pub fn remote(operation: &'static str, code: u16, message: impl Into<String>) -> Self {
        Self::Remote {
            operation,
            code,
            message: message.into(),
        }
    }
}

impl From<CommonError> for SinkError {
    fn from(err: CommonError) -> Self {
        match err {
            CommonError::Serialization(e) => SinkError::Json(e),
            other => SinkError::Config(other.to_string()),
        }
    }
}
