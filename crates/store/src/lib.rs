//! Content-addressed blob storage.
//!
//! Blobs are keyed by the BLAKE3 hash of their uncompressed bytes and grouped
//! into logical categories (`html`, `ssr/d2`, ...). Writing the same bytes
//! twice is free: the second [`ContentStore::put`] finds the first blob and
//! does nothing. Writes go through a temporary file and a rename, so a crash
//! never leaves a half-written blob at its final path.

mod content;
pub mod error;
mod models;
mod path;

pub use crate::content::{BlobStream, ContentStore};
pub use crate::models::Blob;
pub use crate::path::validate as validate_category;
pub use kosh_compress::{Compression, Thresholds};

/// Hex-encoded BLAKE3 hash of `data`.
///
/// ```
/// let hash = kosh_store::hash_bytes(b"hello");
/// assert_eq!(hash.len(), 64);
/// assert_eq!(hash, kosh_store::hash_bytes(b"hello"));
/// ```
#[must_use]
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}
