//! Error types for the scalegrid state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("database open failed: {0}")]
    Open(String),

    #[error("storage transaction failed: {0}")]
    Transaction(String),

    #[error("table access failed: {0}")]
    Table(String),

    #[error("storage read failed: {0}")]
    Read(String),

    #[error("storage write failed: {0}")]
    Write(String),

    #[error("could not encode record: {0}")]
    Serialize(String),

    #[error("could not decode record: {0}")]
    Deserialize(String),

    #[error("invalid scaling rule: {0}")]
    InvalidRule(String),
}
