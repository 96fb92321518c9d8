//! Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. Errors from the content store keep their own frames as
//! children of a [`ErrorKind::Store`] frame.

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// The cache directory couldn't be created, removed or resolved.
    #[display("cache directory error: {}", _0.display())]
    Directory(#[error(not(source))] PathBuf),
    /// The content store failed; see the child frame for the path involved.
    #[display("content store error")]
    Store,
    /// A record failed to encode or decode.
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
    /// A background task panicked or was cancelled.
    #[display("background task failed")]
    Task,
    /// The diagram adapter no longer accepts writes.
    #[display("diagram cache is closed")]
    Closed,
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::Database | ErrorKind::Store)
    }

    /// Whether the cache contents can't be trusted and should be rebuilt.
    pub fn needs_rebuild(&self) -> bool {
        matches!(self, ErrorKind::Migration | ErrorKind::InvalidData(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_kind_display() {
        assert_eq!(ErrorKind::InvalidData("post").to_string(), "invalid cache data: post");
        assert_eq!(ErrorKind::Closed.to_string(), "diagram cache is closed");
    }

    #[test]
    fn error_kind_classification() {
        assert!(ErrorKind::Database.is_retryable());
        assert!(!ErrorKind::Closed.is_retryable());
        assert!(ErrorKind::InvalidData("post").needs_rebuild());
        assert!(!ErrorKind::Store.needs_rebuild());
    }
}
