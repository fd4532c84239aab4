//! Error taxonomy shared across the RPC boundary.

use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Classification of every error that crosses the RPC boundary.
///
/// Each kind maps to a stable HTTP-style status code so clients can
/// decide whether a retry is worthwhile without parsing messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    /// Caller arguments violate schema or constraints. Not retried.
    InputMalformed,
    /// Identity lacks the required permission. Not retried.
    Unauthorized,
    /// Referenced token/endpoint/plan is absent. Not retried.
    NotFound,
    /// Optimistic-concurrency failure on a status transition.
    Conflict,
    /// Queue full. The caller may retry later.
    Backpressure,
    /// Storage connection hiccup. Retried internally before surfacing.
    Transient,
    /// Programmer error, corruption, or misconfiguration.
    Fatal,
}

impl ErrorKind {
    /// Stable status code for this kind.
    pub fn status_code(self) -> u16 {
        match self {
            Self::InputMalformed => 400,
            Self::Unauthorized => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Backpressure => 429,
            Self::Transient => 503,
            Self::Fatal => 500,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InputMalformed => "INPUT_MALFORMED",
            Self::Unauthorized => "UNAUTHORIZED",
            Self::NotFound => "NOT_FOUND",
            Self::Conflict => "CONFLICT",
            Self::Backpressure => "BACKPRESSURE",
            Self::Transient => "TRANSIENT",
            Self::Fatal => "FATAL",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Structured error payload returned to RPC callers.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ApiError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn input_malformed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InputMalformed, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn backpressure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Backpressure, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }
}

/// Errors from packing or unpacking the task envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Invalid kind tag length: {len}")]
    InvalidKindTag { len: usize },

    #[error("Header too short: expected {expected} bytes, got {got}")]
    HeaderTooShort { expected: usize, got: usize },

    #[error("Envelope version mismatch: expected {expected}, got {got}")]
    VersionMismatch { expected: u8, got: u8 },

    #[error("Envelope length mismatch: expected {expected} bytes, got {got}")]
    LengthMismatch { expected: usize, got: usize },

    #[error("Payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}
