//! The cache manager: `meta.db` plus the content store, behind one handle.

mod read;
mod write;

use crate::Database;
use crate::bucket::{self, Bucket};
use crate::error::{ErrorKind, Result};
use crate::memo::ReadCache;
use crate::models::{CacheStats, HtmlRef, PostMeta, Record};
use exn::ResultExt;
use kosh_config::Config;
use kosh_store::ContentStore;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::fs;
use tracing::instrument;

pub(crate) const DB_FILE: &str = "meta.db";
pub(crate) const STORE_DIR: &str = "store";
pub const SCHEMA_VERSION: u32 = 1;

pub(crate) const HTML_CATEGORY: &str = "html";
pub(crate) const SSR_CATEGORY: &str = "ssr";

pub(crate) const KEY_SCHEMA_VERSION: &str = "schema_version";
pub(crate) const KEY_CACHE_ID: &str = "cache_id";
pub(crate) const KEY_GRAPH_HASH: &str = "graph_hash";
pub(crate) const KEY_WASM_HASH: &str = "wasm_hash";
pub(crate) const KEY_BUILD_COUNT: &str = "build_count";
pub(crate) const KEY_BUILDS_SINCE_GC: &str = "builds_since_gc";
pub(crate) const KEY_LAST_GC: &str = "last_gc";
pub(crate) const KEY_DEAD_BYTES: &str = "dead_bytes";
pub(crate) const KEY_STORE_BYTES: &str = "store_bytes";

/// Incremental build cache rooted at a directory.
///
/// ```text
/// <root>/meta.db                                  posts, indices, counters
/// <root>/store/<category>/<h[0:2]>/<h[2:4]>/<h>.{raw,zst}   blobs
/// ```
///
/// A manager owns its directory for as long as it is open: nothing here
/// guards against a second process opening the same cache.
#[derive(Debug)]
pub struct CacheManager {
    root: PathBuf,
    dev_mode: bool,
    config: Config,
    db: Database,
    store: ContentStore,
    memo: ReadCache,
    dirty: RwLock<HashSet<String>>,
}

impl CacheManager {
    /// Open (or create) the cache at `root` with default settings.
    pub async fn open(root: impl AsRef<Path>, dev_mode: bool) -> Result<Self> {
        Self::open_with(root, dev_mode, Config::default()).await
    }

    /// Open the cache described by a loaded configuration.
    pub async fn from_config(config: &Config) -> Result<Self> {
        Self::open_with(&config.cache.root, config.cache.dev_mode, config.clone()).await
    }

    #[instrument(skip(root, config), fields(root = %root.as_ref().display()))]
    pub async fn open_with(root: impl AsRef<Path>, dev_mode: bool, config: Config) -> Result<Self> {
        let root = root.as_ref();
        let root = std::path::absolute(root).or_raise(|| ErrorKind::Directory(root.to_path_buf()))?;
        fs::create_dir_all(&root).await.or_raise(|| ErrorKind::Directory(root.clone()))?;

        let db = Database::connect(root.join(DB_FILE)).await?;
        let version = SCHEMA_VERSION.to_be_bytes();
        if let Err(err) = bucket::insert_if_absent(db.pool(), Bucket::Meta, KEY_SCHEMA_VERSION, &version).await {
            db.close().await;
            return Err(err);
        }
        let store = match ContentStore::new(root.join(STORE_DIR), config.store) {
            Ok(store) => store,
            Err(err) => {
                db.close().await;
                return Err(err).or_raise(|| ErrorKind::Store);
            },
        };
        let memo = ReadCache::new(dev_mode.then(|| Duration::from_millis(config.cache.memo_ttl_ms)));
        tracing::info!(dev_mode, "opened cache");
        Ok(Self { root, dev_mode, config, db, store, memo, dirty: RwLock::default() })
    }

    /// Open the cache, wiping it and starting fresh if it can't be opened.
    ///
    /// A broken cache costs one full build; refusing to build costs more.
    pub async fn open_or_rebuild(root: impl AsRef<Path>, dev_mode: bool, config: Config) -> Result<Self> {
        let root = root.as_ref();
        match Self::open_with(root, dev_mode, config.clone()).await {
            Ok(manager) => Ok(manager),
            Err(err) => {
                tracing::warn!(root = %root.display(), error = %err, "cache unusable, rebuilding from scratch");
                Self::remove_dir(root).await?;
                Self::open_with(root, dev_mode, config).await
            },
        }
    }

    async fn remove_dir(root: &Path) -> Result<()> {
        match fs::remove_dir_all(root).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).or_raise(|| ErrorKind::Directory(root.to_path_buf())),
        }
    }

    pub async fn close(self) {
        self.db.close().await;
    }

    /// Delete the whole cache directory and reopen it empty.
    ///
    /// Process-local state (dirty set, read cache) is dropped as well. The
    /// old manager is consumed either way, so a failed reopen leaves nothing
    /// half-closed behind.
    #[instrument(skip(self), fields(root = %self.root.display()))]
    pub async fn clear(self) -> Result<Self> {
        let Self { root, dev_mode, config, db, .. } = self;
        db.close().await;
        Self::remove_dir(&root).await?;
        let manager = Self::open_with(&root, dev_mode, config).await?;
        tracing::info!("cache cleared");
        Ok(manager)
    }

    /// Force the next build to start from nothing. Same as [`clear`](Self::clear).
    pub async fn rebuild(self) -> Result<Self> {
        self.clear().await
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_dev_mode(&self) -> bool {
        self.dev_mode
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &ContentStore {
        &self.store
    }

    pub(crate) fn db(&self) -> &Database {
        &self.db
    }

    pub(crate) fn memo(&self) -> &ReadCache {
        &self.memo
    }

    // =========================================================================
    // Fingerprints
    // =========================================================================

    /// Compare the stored cache fingerprint with `expected`.
    ///
    /// Returns `true` when they differ (or nothing was stored yet), in which
    /// case the stored value is replaced and the caller should do a full
    /// rebuild.
    #[instrument(skip(self))]
    pub async fn verify_cache_id(&self, expected: &str) -> Result<bool> {
        let stored = bucket::get_string(self.db.pool(), Bucket::Meta, KEY_CACHE_ID).await?;
        if stored.as_deref() == Some(expected) {
            return Ok(false);
        }
        tracing::info!(stored = ?stored, "cache fingerprint changed");
        self.set_cache_id(expected).await?;
        Ok(true)
    }

    pub async fn cache_id(&self) -> Result<Option<String>> {
        bucket::get_string(self.db.pool(), Bucket::Meta, KEY_CACHE_ID).await
    }

    pub async fn set_cache_id(&self, id: &str) -> Result<()> {
        bucket::put_raw(self.db.pool(), Bucket::Meta, KEY_CACHE_ID, id.as_bytes()).await
    }

    pub async fn graph_hash(&self) -> Result<Option<String>> {
        bucket::get_string(self.db.pool(), Bucket::Meta, KEY_GRAPH_HASH).await
    }

    pub async fn set_graph_hash(&self, hash: &str) -> Result<()> {
        bucket::put_raw(self.db.pool(), Bucket::Meta, KEY_GRAPH_HASH, hash.as_bytes()).await
    }

    pub async fn wasm_hash(&self) -> Result<Option<String>> {
        bucket::get_string(self.db.pool(), Bucket::Meta, KEY_WASM_HASH).await
    }

    pub async fn set_wasm_hash(&self, hash: &str) -> Result<()> {
        bucket::put_raw(self.db.pool(), Bucket::Meta, KEY_WASM_HASH, hash.as_bytes()).await
    }

    pub async fn schema_version(&self) -> Result<Option<u32>> {
        bucket::get_raw(self.db.pool(), Bucket::Meta, KEY_SCHEMA_VERSION)
            .await?
            .map(|bytes| {
                let array = <[u8; 4]>::try_from(bytes.as_slice()).or_raise(|| ErrorKind::InvalidData("schema version"))?;
                Ok(u32::from_be_bytes(array))
            })
            .transpose()
    }

    // =========================================================================
    // Social cards
    // =========================================================================

    pub async fn social_card_hash(&self, path: &str) -> Result<Option<String>> {
        bucket::get_string(self.db.pool(), Bucket::SocialCard, path).await
    }

    pub async fn set_social_card_hash(&self, path: &str, hash: &str) -> Result<()> {
        bucket::put_raw(self.db.pool(), Bucket::SocialCard, path, hash.as_bytes()).await
    }

    /// Every recorded social card, path → hash. Unreadable values are skipped.
    pub async fn social_card_hashes(&self) -> Result<BTreeMap<String, String>> {
        let entries = bucket::entries(self.db.pool(), Bucket::SocialCard, None).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| String::from_utf8(entry.value).ok().map(|hash| (entry.key, hash)))
            .collect())
    }

    // =========================================================================
    // Dirty tracking
    // =========================================================================

    /// Flag a post as needing recomputation in the current build.
    pub fn mark_dirty(&self, post_id: &str) {
        self.dirty.write().unwrap_or_else(|p| p.into_inner()).insert(post_id.to_string());
    }

    pub fn is_dirty(&self, post_id: &str) -> bool {
        self.dirty.read().unwrap_or_else(|p| p.into_inner()).contains(post_id)
    }

    pub fn dirty_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.dirty.read().unwrap_or_else(|p| p.into_inner()).iter().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn clear_dirty(&self) {
        self.dirty.write().unwrap_or_else(|p| p.into_inner()).clear();
    }

    // =========================================================================
    // Counters & stats
    // =========================================================================

    /// Bump the build counter and the builds-since-GC counter together.
    pub async fn increment_build_count(&self) -> Result<()> {
        let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
        Self::bump_build_counters(&mut tx).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }

    pub(crate) async fn bump_build_counters(conn: &mut sqlx::SqliteConnection) -> Result<()> {
        for key in [KEY_BUILD_COUNT, KEY_BUILDS_SINCE_GC] {
            let current = bucket::get_u64(&mut *conn, Bucket::Stats, key).await?.unwrap_or(0);
            bucket::put_u64(&mut *conn, Bucket::Stats, key, current + 1).await?;
        }
        Ok(())
    }

    pub async fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats { schema_version: SCHEMA_VERSION, ..Default::default() };
        {
            let mut tx = self.db.pool().begin().await.or_raise(|| ErrorKind::Database)?;
            stats.total_posts = bucket::count(&mut *tx, Bucket::Posts).await?;
            stats.total_ssr = bucket::count(&mut *tx, Bucket::Ssr).await?;
            stats.build_count = bucket::get_u64(&mut *tx, Bucket::Stats, KEY_BUILD_COUNT).await?.unwrap_or(0);
            stats.builds_since_gc = bucket::get_u64(&mut *tx, Bucket::Stats, KEY_BUILDS_SINCE_GC).await?.unwrap_or(0);
            stats.last_gc = match bucket::get_u64(&mut *tx, Bucket::Stats, KEY_LAST_GC).await? {
                Some(secs) => Some(Self::timestamp(secs)?),
                None => None,
            };
            for entry in bucket::entries(&mut *tx, Bucket::Posts, None).await? {
                match PostMeta::decode(&entry.value).map(|post| post.html) {
                    Ok(Some(HtmlRef::Inline(_))) => stats.inline_posts += 1,
                    Ok(Some(HtmlRef::Blob(_))) => stats.hashed_posts += 1,
                    Ok(None) => {},
                    Err(_) => tracing::debug!(post_id = %entry.key, "skipping undecodable post in stats"),
                }
            }
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
        }
        for category in self.categories().await? {
            let bytes = self.store.size(&category).await.or_raise(|| ErrorKind::Store)?;
            stats.store_bytes.insert(category, bytes);
        }
        if let Some(version) = self.schema_version().await? {
            stats.schema_version = version;
        }
        Ok(stats)
    }

    /// Every content store category currently holding (or able to hold) blobs.
    pub(crate) async fn categories(&self) -> Result<Vec<String>> {
        let mut categories = vec![HTML_CATEGORY.to_string()];
        categories.extend(self.store.subcategories(SSR_CATEGORY).await.or_raise(|| ErrorKind::Store)?);
        Ok(categories)
    }

    pub(crate) fn timestamp(secs: u64) -> Result<OffsetDateTime> {
        let secs = i64::try_from(secs).or_raise(|| ErrorKind::InvalidData("timestamp"))?;
        OffsetDateTime::from_unix_timestamp(secs).or_raise(|| ErrorKind::InvalidData("timestamp"))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) async fn open_temp() -> (tempfile::TempDir, CacheManager) {
        let dir = tempfile::tempdir().unwrap();
        let manager = CacheManager::open(dir.path().join("cache"), false).await.unwrap();
        (dir, manager)
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let (dir, manager) = open_temp().await;
        assert!(dir.path().join("cache").join(DB_FILE).exists());
        assert!(dir.path().join("cache").join(STORE_DIR).is_dir());
        assert_eq!(manager.schema_version().await.unwrap(), Some(SCHEMA_VERSION));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        let manager = CacheManager::open(&root, false).await.unwrap();
        manager.set_cache_id("abc").await.unwrap();
        manager.close().await;
        let manager = CacheManager::open(&root, false).await.unwrap();
        assert_eq!(manager.cache_id().await.unwrap().as_deref(), Some("abc"));
        manager.close().await;
    }

    #[tokio::test]
    async fn test_verify_cache_id() {
        let (_dir, manager) = open_temp().await;
        // Nothing stored yet counts as a mismatch.
        assert!(manager.verify_cache_id("v1").await.unwrap());
        assert!(!manager.verify_cache_id("v1").await.unwrap());
        assert!(manager.verify_cache_id("v2").await.unwrap());
        assert_eq!(manager.cache_id().await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_meta_hashes_and_social_cards() {
        let (_dir, manager) = open_temp().await;
        assert_eq!(manager.graph_hash().await.unwrap(), None);
        manager.set_graph_hash("g1").await.unwrap();
        manager.set_wasm_hash("w1").await.unwrap();
        assert_eq!(manager.graph_hash().await.unwrap().as_deref(), Some("g1"));
        assert_eq!(manager.wasm_hash().await.unwrap().as_deref(), Some("w1"));

        manager.set_social_card_hash("posts/a.md", "c1").await.unwrap();
        manager.set_social_card_hash("posts/b.md", "c2").await.unwrap();
        assert_eq!(manager.social_card_hash("posts/a.md").await.unwrap().as_deref(), Some("c1"));
        assert_eq!(manager.social_card_hashes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_dirty_tracking() {
        let (_dir, manager) = open_temp().await;
        assert!(!manager.is_dirty("a"));
        manager.mark_dirty("b");
        manager.mark_dirty("a");
        assert!(manager.is_dirty("a"));
        assert_eq!(manager.dirty_ids(), vec!["a", "b"]);
        manager.clear_dirty();
        assert!(!manager.is_dirty("a"));
    }

    #[tokio::test]
    async fn test_increment_build_count() {
        let (_dir, manager) = open_temp().await;
        manager.increment_build_count().await.unwrap();
        manager.increment_build_count().await.unwrap();
        let stats = manager.stats().await.unwrap();
        assert_eq!(stats.build_count, 2);
        assert_eq!(stats.builds_since_gc, 2);
        assert_eq!(stats.last_gc, None);
        assert_eq!(stats.schema_version, SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_clear_wipes_everything() {
        let (dir, manager) = open_temp().await;
        manager.set_cache_id("abc").await.unwrap();
        manager.store_html("<p>big</p>").await.unwrap();
        manager.mark_dirty("x");
        let manager = manager.clear().await.unwrap();
        assert_eq!(manager.cache_id().await.unwrap(), None);
        assert!(manager.store().list_hashes("html").await.unwrap().is_empty());
        assert!(!manager.is_dirty("x"));
        assert!(dir.path().join("cache").join(DB_FILE).exists());

        let manager = manager.rebuild().await.unwrap();
        assert_eq!(manager.stats().await.unwrap().total_posts, 0);
    }

    #[tokio::test]
    async fn test_open_or_rebuild_recovers_from_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("cache");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join(DB_FILE), b"this is not a sqlite database, not even close").unwrap();
        let manager = CacheManager::open_or_rebuild(&root, false, Config::default()).await.unwrap();
        assert_eq!(manager.schema_version().await.unwrap(), Some(SCHEMA_VERSION));
        manager.close().await;
    }
}
