//! Size-tiered compression for content-addressed blobs.
//!
//! Blobs are stored in one of three ways depending on their size:
//!
//! - **Raw** below [`Thresholds::raw`]: the zstd frame overhead would eat
//!   whatever it saves, so the bytes are kept as-is (`.raw`).
//! - **Fast zstd** up to [`Thresholds::fast`]: cheap to produce, decent ratio.
//! - **Default zstd** above that: a better ratio where it is worth the CPU.
//!
//! Both zstd tiers share the `.zst` extension and the same decoder, so a
//! reader only needs to know *whether* a blob is compressed, never how hard.

mod construct;
pub mod error;
mod ops;
mod util;

use serde::{Deserialize, Serialize};

/// How a blob is encoded on disk.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Compression {
    /// Stored verbatim (.raw)
    #[default]
    None,
    /// Zstd at the fastest level (.zst)
    ZstdFast,
    /// Zstd at the default level (.zst)
    Zstd,
}

/// Size boundaries used by [`Compression::for_size`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Thresholds {
    /// Payloads strictly smaller than this are stored raw.
    pub raw: usize,
    /// Payloads strictly smaller than this (and not raw) use fast zstd.
    pub fast: usize,
}
impl Default for Thresholds {
    fn default() -> Self {
        Self { raw: 512, fast: 64 * 1024 }
    }
}

impl Compression {
    /// Pick the compression tier for a payload of `len` bytes.
    #[must_use]
    pub fn for_size(len: usize, thresholds: Thresholds) -> Self {
        if len < thresholds.raw {
            Compression::None
        } else if len < thresholds.fast {
            Compression::ZstdFast
        } else {
            Compression::Zstd
        }
    }
}
