//! Error types surfaced to clients and across the crate.

use thiserror::Error;

/// Error categories carried on `ERR` frames.
///
/// `StoreUnavailable` is the only retryable kind; everything else is a
/// caller or server fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Task id collision on `ADD`.
    Conflict,
    /// Unknown queue or task where one is required.
    NotFound,
    /// Malformed envelope or bad payload.
    InvalidArgument,
    Unauthenticated,
    /// Backing store unreachable after bounded retries.
    StoreUnavailable,
    Internal,
}

impl ErrorKind {
    /// Wire code used in the `error.code` field of ERR frames.
    pub fn code(self) -> &'static str {
        match self {
            ErrorKind::Conflict => "CONFLICT",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::InvalidArgument => "INVALID_ARGUMENT",
            ErrorKind::Unauthenticated => "UNAUTHENTICATED",
            ErrorKind::StoreUnavailable => "BACKING_STORE_UNAVAILABLE",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    pub fn from_code(code: &str) -> Self {
        match code {
            "CONFLICT" => ErrorKind::Conflict,
            "NOT_FOUND" => ErrorKind::NotFound,
            "INVALID_ARGUMENT" => ErrorKind::InvalidArgument,
            "UNAUTHENTICATED" => ErrorKind::Unauthenticated,
            "BACKING_STORE_UNAVAILABLE" => ErrorKind::StoreUnavailable,
            _ => ErrorKind::Internal,
        }
    }

    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::StoreUnavailable)
    }
}

#[derive(Debug, Error)]
#[error("{} ({})", message, kind.code())]
pub struct ZakuError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ZakuError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidArgument, message)
    }

    pub fn unauthenticated(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthenticated, message)
    }

    pub fn store_unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::StoreUnavailable, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, message)
    }
}

impl From<serde_json::Error> for ZakuError {
    fn from(e: serde_json::Error) -> Self {
        ZakuError::internal(format!("json: {e}"))
    }
}

impl From<std::io::Error> for ZakuError {
    fn from(e: std::io::Error) -> Self {
        ZakuError::internal(format!("io: {e}"))
    }
}

pub type Result<T> = std::result::Result<T, ZakuError>;
