//! Error types for bqsink wire types

use thiserror::Error;

/// Result type alias for wire-type operations
pub type Result<T> = std::result::Result<T, CommonError>;

/// Errors raised while interpreting wire values
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid field type: {0}")]
    InvalidFieldType(String),

    #[error("Unrecognized mode: {0}")]
    InvalidFieldMode(String),
}
