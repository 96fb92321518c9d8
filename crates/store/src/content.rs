//! Sharded blob storage on the local filesystem.
//!
//! Files are accessed with `tokio::fs`; compression runs on the blocking pool
//! so large payloads never stall the runtime.

use crate::error::{ErrorKind, Result};
use crate::path::{shard, validate as validate_category, validate_hash};
use crate::{Blob, hash_bytes};
use async_stream::stream;
use exn::ResultExt;
use futures::{Stream, TryStreamExt};
use kosh_compress::{Compression, Thresholds};
use std::borrow::Cow;
use std::ffi::OsString;
use std::fs::create_dir_all as sync_create_dir;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs::{self, DirEntry};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::instrument;

pub type BlobStream<'a> = Pin<Box<dyn Stream<Item = Result<Blob>> + Send + 'a>>;

// Concurrent puts of the same content must not share a temporary file, or
// one writer's rename would pull the file out from under the other.
static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

enum WalkEntry {
    Blob(Blob),
    Descend(PathBuf),
    Skip,
}

/// Content-addressed blob store rooted at a directory.
///
/// # Examples
///
/// ```no_run
/// use kosh_store::{ContentStore, Thresholds};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let store = ContentStore::new("/var/cache/kosh/store", Thresholds::default())?;
/// let blob = store.put("html", b"<p>hello</p>").await?;
/// let bytes = store.get("html", &blob.hash, blob.compression.is_compressed()).await?;
/// assert_eq!(bytes.as_deref(), Some(&b"<p>hello</p>"[..]));
/// # Ok(())
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct ContentStore {
    root: PathBuf,
    thresholds: Thresholds,
}
impl ContentStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the path is not absolute, exists but isn't a
    /// directory, or can't be created.
    pub fn new(root: impl AsRef<Path>, thresholds: Thresholds) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        if !root.is_absolute() {
            exn::bail!(ErrorKind::InvalidCategory(root));
        }
        if root.exists() {
            if !root.is_dir() {
                exn::bail!(ErrorKind::InvalidCategory(root));
            }
        } else {
            // Only happens once when the cache is opened; not worth an async constructor.
            sync_create_dir(&root).map_err(|e| ErrorKind::io(e, &root))?;
        }
        Ok(Self { root, thresholds })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    fn blob_path(&self, category: &Path, hash: &str, compression: Compression) -> PathBuf {
        let mut name: OsString = self.root.join(shard(category, hash)).into_os_string();
        name.push(compression.extension());
        PathBuf::from(name)
    }

    fn tmp_path(target: &Path) -> PathBuf {
        let mut name = target.as_os_str().to_os_string();
        name.push(format!(".{}.tmp", TMP_COUNTER.fetch_add(1, Ordering::Relaxed)));
        PathBuf::from(name)
    }

    /// Both on-disk encodings of a blob, `preferred` first.
    fn candidates(preferred: Compression) -> [Compression; 2] {
        match preferred.is_compressed() {
            true => [Compression::Zstd, Compression::None],
            false => [Compression::None, Compression::Zstd],
        }
    }

    /// Store `data` under `category`, returning where it ended up.
    ///
    /// If a blob with the same hash already exists under either extension
    /// nothing is written and the existing blob is returned.
    #[instrument(skip(self, data), fields(category = %category, input_size = data.len(), hash))]
    pub async fn put(&self, category: &str, data: &[u8]) -> Result<Blob> {
        let category = validate_category(category)?;
        let hash = hash_bytes(data);
        tracing::Span::current().record("hash", hash.as_str());

        if let Some(existing) = self.locate_in(&category, &hash).await? {
            tracing::trace!("blob already stored");
            return Ok(existing);
        }

        let compression = Compression::for_size(data.len(), self.thresholds);
        let encoded: Cow<'_, [u8]> = match compression.is_compressed() {
            false => Cow::Borrowed(data),
            true => {
                let owned = data.to_vec();
                let bytes = tokio::task::spawn_blocking(move || compression.compress(&owned))
                    .await
                    .or_raise(|| ErrorKind::Task)?
                    .map_err(ErrorKind::compression)?;
                Cow::Owned(bytes)
            },
        };

        let target = self.blob_path(&category, &hash, compression);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).await.map_err(|e| ErrorKind::io(e, parent))?;
        }
        let tmp = Self::tmp_path(&target);
        if let Err(err) = Self::write_atomic(&tmp, &target, &encoded).await {
            // The final path is either untouched or fully renamed; only the
            // temporary file can be left behind.
            _ = fs::remove_file(&tmp).await;
            return Err(err);
        }
        tracing::debug!(compression = %compression, stored_size = encoded.len(), "stored blob");
        Ok(Blob::new(hash, compression, encoded.len() as u64))
    }

    async fn write_atomic(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
        let mut file = fs::File::create(tmp).await.map_err(|e| ErrorKind::io(e, tmp))?;
        file.write_all(bytes).await.map_err(|e| ErrorKind::io(e, tmp))?;
        file.flush().await.map_err(|e| ErrorKind::io(e, tmp))?;
        file.sync_all().await.map_err(|e| ErrorKind::io(e, tmp))?;
        drop(file);
        fs::rename(tmp, target).await.map_err(|e| ErrorKind::io(e, target))?;
        Ok(())
    }

    /// Read a blob back, decompressing it if needed.
    ///
    /// `compressed` says which extension to try first; if that file is
    /// missing the other one is tried before giving up. Returns `Ok(None)`
    /// when neither exists.
    #[instrument(skip(self), fields(category = %category))]
    pub async fn get(&self, category: &str, hash: &str, compressed: bool) -> Result<Option<Vec<u8>>> {
        let category = validate_category(category)?;
        let hash = validate_hash(hash)?;
        let expected = if compressed { Compression::Zstd } else { Compression::None };
        for compression in Self::candidates(expected) {
            let path = self.blob_path(&category, hash, compression);
            let raw = match fs::read(&path).await {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => exn::bail!(ErrorKind::io(err, &path)),
            };
            if compression != expected {
                tracing::warn!(path = %path.display(), "blob found under unexpected extension");
            }
            if !compression.is_compressed() {
                return Ok(Some(raw));
            }
            let decoded = tokio::task::spawn_blocking(move || compression.decompress(&raw))
                .await
                .or_raise(|| ErrorKind::Task)?
                .map_err(ErrorKind::compression)?;
            return Ok(Some(decoded));
        }
        Ok(None)
    }

    /// Find a blob under either extension.
    pub async fn locate(&self, category: &str, hash: &str) -> Result<Option<Blob>> {
        let category = validate_category(category)?;
        self.locate_in(&category, validate_hash(hash)?).await
    }

    async fn locate_in(&self, category: &Path, hash: &str) -> Result<Option<Blob>> {
        for compression in Self::candidates(Compression::None) {
            let path = self.blob_path(category, hash, compression);
            match fs::metadata(&path).await {
                Ok(meta) if meta.is_file() => return Ok(Some(Blob::new(hash, compression, meta.len()))),
                Ok(_) => {},
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => exn::bail!(ErrorKind::io(err, &path)),
            }
        }
        Ok(None)
    }

    pub async fn exists(&self, category: &str, hash: &str) -> Result<bool> {
        Ok(self.locate(category, hash).await?.is_some())
    }

    /// Bytes on disk for a blob, summed across both extensions.
    pub async fn blob_size(&self, category: &str, hash: &str) -> Result<u64> {
        let category = validate_category(category)?;
        let hash = validate_hash(hash)?;
        let mut total = 0;
        for compression in Self::candidates(Compression::None) {
            let path = self.blob_path(&category, hash, compression);
            match fs::metadata(&path).await {
                Ok(meta) => total += meta.len(),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => exn::bail!(ErrorKind::io(err, &path)),
            }
        }
        Ok(total)
    }

    /// Remove a blob under both extensions.
    ///
    /// Missing files are not an error. Both removals are always attempted;
    /// the first real failure is returned afterwards.
    #[instrument(skip(self), fields(category = %category))]
    pub async fn delete(&self, category: &str, hash: &str) -> Result<()> {
        let category = validate_category(category)?;
        let hash = validate_hash(hash)?;
        let mut failure = None;
        for compression in Self::candidates(Compression::None) {
            let path = self.blob_path(&category, hash, compression);
            match fs::remove_file(&path).await {
                Ok(()) => tracing::trace!(path = %path.display(), "deleted blob"),
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {},
                Err(err) => {
                    failure.get_or_insert(ErrorKind::io(err, &path));
                },
            }
        }
        match failure {
            Some(kind) => Err(kind.into()),
            None => Ok(()),
        }
    }

    /// Read up to `len` raw (still encoded) bytes from the start of a blob file.
    pub async fn read_head(
        &self,
        category: &str,
        hash: &str,
        compression: Compression,
        len: usize,
    ) -> Result<Option<Vec<u8>>> {
        let category = validate_category(category)?;
        let path = self.blob_path(&category, validate_hash(hash)?, compression);
        let file = match fs::File::open(&path).await {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => exn::bail!(ErrorKind::io(err, &path)),
        };
        let mut buffer = Vec::with_capacity(len);
        file.take(len as u64).read_to_end(&mut buffer).await.map_err(|e| ErrorKind::io(e, &path))?;
        Ok(Some(buffer))
    }

    /// Walk every blob stored under `category`.
    ///
    /// A category that has never been written to yields nothing rather than
    /// an error. Temporary files and anything else without a blob extension
    /// are ignored.
    pub fn blobs<'a>(&'a self, category: &'a str) -> BlobStream<'a> {
        let start = match validate_category(category) {
            Ok(category) => self.root.join(category),
            Err(e) => return Box::pin(futures::stream::once(async { Result::Err(e) })),
        };
        let mut stack = vec![start];

        Box::pin(stream! {
            'dirs: while let Some(current) = stack.pop() {
                let mut entries = match fs::read_dir(&current).await {
                    Ok(entries) => entries,
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                    Err(err) => {
                        yield Err(exn::Exn::from(ErrorKind::io(err, &current)));
                        continue 'dirs;
                    }
                };
                'entries: loop {
                    let entry = match entries.next_entry().await {
                        Ok(Some(entry)) => entry,
                        Ok(None) => break 'entries,
                        Err(err) => { yield Err(exn::Exn::from(ErrorKind::io(err, &current))); continue 'entries; },
                    };
                    match Self::process_entry(entry).await {
                        Ok(WalkEntry::Blob(blob)) => yield Ok(blob),
                        Ok(WalkEntry::Descend(dir)) => stack.push(dir),
                        Ok(WalkEntry::Skip) => {},
                        Err(e) => yield Err(e),
                    }
                }
            }
        })
    }

    async fn process_entry(entry: DirEntry) -> Result<WalkEntry> {
        let path = entry.path();
        let metadata = entry.metadata().await.map_err(|e| ErrorKind::io(e, &path))?;
        if metadata.is_dir() {
            return Ok(WalkEntry::Descend(path));
        }
        if !metadata.is_file() {
            return Ok(WalkEntry::Skip);
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(WalkEntry::Skip);
        };
        for extension in Compression::extensions() {
            if let Some(hash) = name.strip_suffix(extension) {
                let compression = Compression::from_path(&path);
                return Ok(WalkEntry::Blob(Blob::new(hash, compression, metadata.len())));
            }
        }
        Ok(WalkEntry::Skip)
    }

    /// Every distinct hash stored under `category`, sorted.
    #[instrument(skip(self), fields(category = %category, count))]
    pub async fn list_hashes(&self, category: &str) -> Result<Vec<String>> {
        let mut hashes: Vec<String> = self.blobs(category).map_ok(|blob| blob.hash).try_collect().await?;
        hashes.sort_unstable();
        hashes.dedup();
        tracing::Span::current().record("count", hashes.len());
        Ok(hashes)
    }

    /// Total bytes on disk under `category`.
    pub async fn size(&self, category: &str) -> Result<u64> {
        self.blobs(category).try_fold(0u64, |total, blob| async move { Ok(total + blob.size) }).await
    }

    /// Immediate sub-categories of `parent`, e.g. `ssr` gives `ssr/d2`, `ssr/katex`.
    pub async fn subcategories(&self, parent: &str) -> Result<Vec<String>> {
        let parent_path = validate_category(parent)?;
        let dir = self.root.join(&parent_path);
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => exn::bail!(ErrorKind::io(err, &dir)),
        };
        let mut categories = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| ErrorKind::io(e, &dir))? {
            let is_dir = entry.file_type().await.map_err(|e| ErrorKind::io(e, &dir))?.is_dir();
            if let (true, Some(name)) = (is_dir, entry.file_name().to_str()) {
                categories.push(format!("{}/{}", parent_path.display(), name));
            }
        }
        categories.sort_unstable();
        Ok(categories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn store() -> (tempfile::TempDir, ContentStore) {
        let temp_dir = tempfile::tempdir().unwrap();
        let store = ContentStore::new(temp_dir.path(), Thresholds::default()).unwrap();
        (temp_dir, store)
    }

    /// Deterministic, mildly compressible payload.
    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| b"<p>kosh static site</p>\n"[i % 24]).collect()
    }

    async fn files_under(dir: &Path) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let mut stack = vec![dir.to_path_buf()];
        while let Some(current) = stack.pop() {
            let mut entries = fs::read_dir(&current).await.unwrap();
            while let Some(entry) = entries.next_entry().await.unwrap() {
                if entry.file_type().await.unwrap().is_dir() {
                    stack.push(entry.path());
                } else {
                    found.push(entry.path());
                }
            }
        }
        found
    }

    #[test]
    fn test_new_requires_absolute_path() {
        let temp_dir = tempfile::tempdir().unwrap();
        assert!(ContentStore::new(temp_dir.path(), Thresholds::default()).is_ok());
        assert!(ContentStore::new("relative/store", Thresholds::default()).is_err());
    }

    #[rstest]
    #[case(0, Compression::None)]
    #[case(511, Compression::None)]
    #[case(512, Compression::ZstdFast)]
    #[case(65_535, Compression::ZstdFast)]
    #[case(65_536, Compression::Zstd)]
    #[case(1_048_576, Compression::Zstd)]
    #[tokio::test]
    async fn test_put_get_across_thresholds(#[case] len: usize, #[case] expected: Compression) {
        let (_dir, store) = store();
        let data = payload(len);
        let blob = store.put("html", &data).await.unwrap();
        assert_eq!(blob.hash, hash_bytes(&data));
        assert_eq!(blob.compression, expected);
        let read = store.get("html", &blob.hash, blob.compression.is_compressed()).await.unwrap();
        assert_eq!(read.unwrap(), data);
    }

    #[tokio::test]
    async fn test_put_is_idempotent() {
        let (dir, store) = store();
        let data = payload(4096);
        let first = store.put("ssr/d2", &data).await.unwrap();
        let second = store.put("ssr/d2", &data).await.unwrap();
        assert_eq!(first.hash, second.hash);
        let files = files_under(dir.path()).await;
        assert_eq!(files.len(), 1, "expected a single blob, found {files:?}");
        assert!(files[0].ends_with(format!("ssr/d2/{}/{}/{}.zst", &first.hash[..2], &first.hash[2..4], first.hash)));
    }

    #[tokio::test]
    async fn test_concurrent_identical_puts() {
        let (dir, store) = store();
        let data = payload(100_000);
        let (a, b) = tokio::join!(store.put("html", &data), store.put("html", &data));
        assert_eq!(a.unwrap().hash, b.unwrap().hash);
        assert_eq!(files_under(dir.path()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_get_falls_back_to_other_extension() {
        let (_dir, store) = store();
        let data = payload(10);
        let blob = store.put("html", &data).await.unwrap();
        assert_eq!(blob.compression, Compression::None);
        // Ask for the compressed variant; the raw file is found instead.
        assert_eq!(store.get("html", &blob.hash, true).await.unwrap().unwrap(), data);
    }

    #[tokio::test]
    async fn test_failed_write_leaves_nothing_behind() {
        let (dir, store) = store();
        let data = payload(10);
        let hash = hash_bytes(&data);
        // A directory squatting on the blob path makes the final rename fail.
        let target = store.blob_path(Path::new("html"), &hash, Compression::None);
        fs::create_dir_all(target.join("occupied")).await.unwrap();

        assert!(store.put("html", &data).await.is_err());
        let files = files_under(dir.path()).await;
        assert!(files.iter().all(|f| !f.to_string_lossy().ends_with(".tmp")), "leftover files: {files:?}");
        assert!(fs::metadata(&target).await.unwrap().is_dir());
        assert!(!store.exists("html", &hash).await.unwrap());

        fs::remove_dir_all(&target).await.unwrap();
        assert!(store.get("html", &hash, false).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_none() {
        let (_dir, store) = store();
        assert!(store.get("html", &hash_bytes(b"nope"), false).await.unwrap().is_none());
        assert!(!store.exists("html", &hash_bytes(b"nope")).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_is_best_effort() {
        let (_dir, store) = store();
        let blob = store.put("html", &payload(2048)).await.unwrap();
        assert!(store.exists("html", &blob.hash).await.unwrap());
        store.delete("html", &blob.hash).await.unwrap();
        assert!(!store.exists("html", &blob.hash).await.unwrap());
        // Second delete is a no-op.
        store.delete("html", &blob.hash).await.unwrap();
    }

    #[tokio::test]
    async fn test_list_hashes_and_size() {
        let (_dir, store) = store();
        assert!(store.list_hashes("html").await.unwrap().is_empty());
        assert_eq!(store.size("html").await.unwrap(), 0);

        let a = store.put("html", &payload(100)).await.unwrap();
        let b = store.put("html", &payload(200)).await.unwrap();
        store.put("ssr/katex", &payload(300)).await.unwrap();

        let mut expected = vec![a.hash.clone(), b.hash.clone()];
        expected.sort();
        assert_eq!(store.list_hashes("html").await.unwrap(), expected);
        assert_eq!(store.size("html").await.unwrap(), a.size + b.size);
        assert_eq!(store.blob_size("html", &a.hash).await.unwrap(), a.size);
    }

    #[tokio::test]
    async fn test_list_ignores_temporary_files() {
        let (dir, store) = store();
        let blob = store.put("html", &payload(64)).await.unwrap();
        let stray = dir.path().join("html").join(&blob.hash[..2]).join("leftover.raw.7.tmp");
        fs::write(&stray, b"partial").await.unwrap();
        assert_eq!(store.list_hashes("html").await.unwrap(), vec![blob.hash]);
    }

    #[tokio::test]
    async fn test_subcategories() {
        let (_dir, store) = store();
        assert!(store.subcategories("ssr").await.unwrap().is_empty());
        store.put("ssr/katex", b"x").await.unwrap();
        store.put("ssr/d2", b"y").await.unwrap();
        assert_eq!(store.subcategories("ssr").await.unwrap(), vec!["ssr/d2", "ssr/katex"]);
    }

    #[tokio::test]
    async fn test_read_head() {
        let (_dir, store) = store();
        let blob = store.put("html", &payload(100_000)).await.unwrap();
        let head = store.read_head("html", &blob.hash, blob.compression, 4).await.unwrap().unwrap();
        assert!(Compression::Zstd.check_magic_bytes(&head));
        assert!(store.read_head("html", &blob.hash, Compression::None, 4).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rejects_invalid_input() {
        let (_dir, store) = store();
        assert!(store.put("../escape", b"x").await.is_err());
        assert!(store.get("html", "../../etc/passwd", false).await.is_err());
    }
}
