//! Error types for queue storage and payload handling.
//!
//! Storage failures are mapped from `sqlx` into a small taxonomy so the
//! delivery crate can report them as internal errors without depending on the
//! storage engine.

use thiserror::Error;

use crate::models::PayloadId;

/// Result type alias using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core error type for storage and serialization operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Payload not present in the queue.
    #[error("payload {0} not found")]
    PayloadNotFound(PayloadId),

    /// Constraint violation.
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    /// Stored or supplied data could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid input.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A queued row exists but cannot be decoded.
    ///
    /// `key` is the stored id text, usable with `QueueStore::remove_corrupt`
    /// even when it is not a valid payload id.
    #[error("corrupt payload {key}: {message}")]
    CorruptPayload {
        /// Stored id of the row.
        key: String,
        /// Why decoding failed.
        message: String,
    },
}

impl CoreError {
    /// Creates a corrupt payload error for the row stored under `key`.
    pub fn corrupt_payload(key: impl Into<String>, message: impl ToString) -> Self {
        Self::CorruptPayload { key: key.into(), message: message.to_string() }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                Self::ConstraintViolation(format!("unique constraint violation: {db_err}"))
            },
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                Self::ConstraintViolation(format!("foreign key constraint violation: {db_err}"))
            },
            sqlx::Error::ColumnDecode { index, source } => {
                Self::Serialization(format!("column {index}: {source}"))
            },
            _ => Self::Database(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<uuid::Error> for CoreError {
    fn from(err: uuid::Error) -> Self {
        Self::Serialization(format!("invalid payload id: {err}"))
    }
}
