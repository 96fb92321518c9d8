use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Aggregate view of the cache, as returned by
/// [`CacheManager::stats`](crate::CacheManager::stats).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub total_posts: u64,
    pub total_ssr: u64,
    /// Posts whose HTML is stored inside the record
    pub inline_posts: u64,
    /// Posts whose HTML lives in the content store
    pub hashed_posts: u64,
    pub build_count: u64,
    pub builds_since_gc: u64,
    pub last_gc: Option<OffsetDateTime>,
    /// Bytes on disk per content store category
    pub store_bytes: BTreeMap<String, u64>,
    pub schema_version: u32,
}
impl CacheStats {
    pub fn total_store_bytes(&self) -> u64 {
        self.store_bytes.values().sum()
    }
}
