//! Error types for Tether Core.

use thiserror::Error;

/// Errors raised while converting between envelopes and stored records.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid record: {0}")]
    InvalidRecord(String),

    #[error("invalid key in field {field}: {value}")]
    InvalidKey { field: String, value: String },

    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
