//! Store error classification.

use thiserror::Error;
use verdict_protocol::{ApiError, ErrorKind};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// A status-predicated write affected no rows: the record moved
    /// underneath us. Callers re-read and re-evaluate.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid stored data: {0}")]
    InvalidData(String),

    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidData(err.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(msg) => ApiError::not_found(msg),
            StoreError::Conflict(msg) => ApiError::conflict(msg),
            StoreError::InvalidData(msg) => ApiError::new(ErrorKind::Fatal, msg),
            StoreError::Db(e) => ApiError::transient(format!("storage error: {e}")),
        }
    }
}
