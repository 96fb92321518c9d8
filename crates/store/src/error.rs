//! Content Store Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction.

use derive_more::{Display, Error};
use kosh_compress::error::{Error as CompressionError, ErrorKind as CompressionErrorKind};
use std::io::Error as IoError;
use std::path::{Path, PathBuf};

/// A content store error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for content store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// Access denied while touching a blob or shard directory
    #[display("permission denied: {}", _0.display())]
    PermissionDenied(#[error(not(source))] PathBuf),
    /// Underlying I/O error, with the path that was being operated on
    #[display("I/O error at {}: {source}", path.display())]
    Io {
        #[error(not(source))]
        path: PathBuf,
        source: IoError,
    },
    /// Category contains invalid components or escapes the store root
    #[display("invalid category: {}", _0.display())]
    InvalidCategory(#[error(not(source))] PathBuf),
    /// Hash is empty or not lowercase hex
    #[display("invalid blob hash: {_0:?}")]
    InvalidHash(#[error(not(source))] String),
    /// Compression/decompression error
    #[display("compression error: {_0}")]
    Compression(CompressionErrorKind),
    /// A blocking compression task panicked or was cancelled
    #[display("background task failed")]
    Task,
}
impl ErrorKind {
    /// Classify an I/O error, keeping the path it happened at.
    pub fn io(err: IoError, path: &Path) -> Self {
        match err.kind() {
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ => Self::Io { path: path.to_path_buf(), source: err },
        }
    }

    /// Convert a compression error into a store error, preserving the
    /// compress crate's `Exn` frame as a child in the error tree.
    #[track_caller]
    pub fn compression(err: CompressionError) -> Error {
        let inner = (*err).clone();
        err.raise(ErrorKind::Compression(inner))
    }

    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io { .. } | Self::Task)
    }
}
