//! Incremental build cache for the site generator.
//!
//! The cache is disposable: it only ever holds things that can be recomputed
//! from the sources, so when in doubt (fingerprint change, failed open,
//! verification findings) the answer is to throw it away and rebuild.
//!
//! # Architecture
//! - **[`CacheManager`]**: post metadata, search records, dependency lists and
//!   SSR artifact records in a single SQLite file (`meta.db`), split into
//!   named buckets. All writes for a build happen in one transaction.
//! - **Content store**: rendered HTML and SSR output, content-addressed on
//!   disk and compressed by size (see [`kosh_store`]).
//! - **Dependency indices**: `{value}/{post id}` keys answering "which posts
//!   use this tag, template or include".
//! - **Garbage collection** and **verification** over both of the above.
//! - **[`DiagramCacheAdapter`]**: in-memory, write-behind front for the
//!   diagram renderer.

pub mod adapter;
mod bucket;
mod db;
pub mod error;
pub mod gc;
pub mod hash;
mod index;
mod manager;
mod memo;
pub mod models;
pub mod verify;

pub use crate::adapter::DiagramCacheAdapter;
pub use crate::db::Database;
pub use crate::gc::{GcDecision, GcReport, GcSettings, SkipReason};
pub use crate::hash::{hash_bytes, hash_str, normalize_path, post_id};
pub use crate::index::IndexKind;
pub use crate::manager::{CacheManager, SCHEMA_VERSION};
pub use crate::models::{CacheStats, Dependencies, HtmlRef, PostListMeta, PostMeta, SearchRecord, SsrArtifact, TocEntry};
pub use crate::verify::Finding;
pub use kosh_config::Config;
