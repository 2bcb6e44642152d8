// Error kinds for the billing-core substrate.
//
// The set is intentionally closed: every public operation across the cache
// hierarchy, DB pool, and device pool resolves to one of these kinds. Each
// error carries a stable kind, an opaque id for log correlation, and a
// timestamp, per the error-handling design this crate follows.

use chrono::{DateTime, Utc};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    #[error("validation")]
    Validation,
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
    #[error("conflict")]
    Conflict,
    #[error("timeout")]
    Timeout,
    #[error("unavailable")]
    Unavailable,
    #[error("transient")]
    Transient,
    #[error("fatal")]
    Fatal,
}

/// A user-visible failure. Always carries a stable kind, an opaque
/// `error_id` for log correlation, and a `timestamp`. In non-release builds
/// the message includes a captured backtrace string.
#[derive(Error, Debug, Clone)]
#[error("{kind}: {message} (id={error_id})")]
pub struct Error {
    pub kind: ErrorKind,
    pub message: String,
    pub error_id: Uuid,
    pub timestamp: DateTime<Utc>,
    #[cfg(debug_assertions)]
    pub backtrace: Option<String>,
}

impl Error {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            #[cfg(debug_assertions)]
            backtrace: Some(std::backtrace::Backtrace::force_capture().to_string()),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unauthorized, message)
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unavailable, message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Fatal, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_retriable(&self) -> bool {
        matches!(self.kind, ErrorKind::Transient | ErrorKind::Timeout)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::transient(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::timeout("operation deadline elapsed")
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips() {
        let e = Error::unavailable("no healthy replica");
        assert_eq!(e.kind(), ErrorKind::Unavailable);
        assert!(!e.is_retriable());
    }

    #[test]
    fn transient_and_timeout_are_retriable() {
        assert!(Error::transient("x").is_retriable());
        assert!(Error::timeout("x").is_retriable());
        assert!(!Error::fatal("x").is_retriable());
    }
}
