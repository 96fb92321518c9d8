//! Short-lived in-memory cache in front of post lookups.

use crate::models::PostMeta;
use std::collections::HashMap;
use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Memoized lookups keyed `id:{post id}` / `path:{normalized path}`.
///
/// Entries expire after the TTL and are dropped explicitly whenever the
/// underlying record is written or deleted. A disabled cache stores nothing.
#[derive(Debug)]
pub(crate) struct ReadCache {
    ttl: Option<Duration>,
    entries: RwLock<HashMap<String, (Instant, PostMeta)>>,
}
impl ReadCache {
    pub fn new(ttl: Option<Duration>) -> Self {
        Self { ttl: ttl.filter(|ttl| !ttl.is_zero()), entries: RwLock::default() }
    }

    pub fn id_key(id: &str) -> String {
        format!("id:{id}")
    }

    pub fn path_key(path: &str) -> String {
        format!("path:{path}")
    }

    pub fn get(&self, key: &str) -> Option<PostMeta> {
        let ttl = self.ttl?;
        let entries = self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries
            .get(key)
            .filter(|(stored, _)| stored.elapsed() < ttl)
            .map(|(_, post)| post.clone())
    }

    pub fn insert(&self, key: String, post: &PostMeta) {
        if self.ttl.is_none() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        entries.insert(key, (Instant::now(), post.clone()));
    }

    /// Drop both lookup keys of every post in `posts`.
    pub fn invalidate<'a>(&self, posts: impl IntoIterator<Item = (&'a str, &'a str)>) {
        if self.ttl.is_none() {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner());
        for (id, path) in posts {
            entries.remove(&Self::id_key(id));
            entries.remove(&Self::path_key(path));
        }
    }
}
