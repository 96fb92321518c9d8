//! Records persisted in `meta.db`.
//!
//! Records are JSON with explicit, stable field names; a field may be
//! renamed in Rust but never on disk. Empty optional fields are omitted when
//! writing and defaulted when reading, so older records keep decoding after
//! fields are added.

mod deps;
mod post;
mod search;
mod ssr;
mod stats;

pub use self::deps::Dependencies;
pub use self::post::{HtmlRef, PostListMeta, PostMeta, TocEntry};
pub use self::search::SearchRecord;
pub use self::ssr::SsrArtifact;
pub use self::stats::CacheStats;

use crate::error::{ErrorKind, Result};
use exn::ResultExt;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A value that can be stored in a bucket.
pub trait Record: Serialize + DeserializeOwned + Send {
    /// Used in error messages.
    const KIND: &'static str;

    fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).or_raise(|| ErrorKind::InvalidData(Self::KIND))
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).or_raise(|| ErrorKind::InvalidData(Self::KIND))
    }
}
