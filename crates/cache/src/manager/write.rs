use super::{CacheManager, HTML_CATEGORY};
use crate::bucket::{self, Bucket};
use crate::error::{ErrorKind, Result};
use crate::hash::{hash_bytes, normalize_path};
use crate::index;
use crate::models::{Dependencies, HtmlRef, PostMeta, Record, SearchRecord, SsrArtifact};
use exn::ResultExt;
use sqlx::SqliteConnection;
use std::collections::HashMap;
use time::OffsetDateTime;
use tracing::instrument;

// Below this many posts, encoding on the async task beats spawning workers.
const PARALLEL_ENCODE_MIN: usize = 64;

type Pending = (PostMeta, Option<SearchRecord>, Option<Dependencies>);

/// A post and its side records, serialized and ready to write.
struct Encoded {
    post: PostMeta,
    path: String,
    data: Vec<u8>,
    search: Option<Vec<u8>>,
    deps: Option<(Dependencies, Vec<u8>)>,
}

fn encode_one((post, search, deps): Pending) -> Result<Encoded> {
    if post.post_id.is_empty() {
        exn::bail!(ErrorKind::InvalidData("post id"));
    }
    let data = post.encode()?;
    let search = search.map(|record| record.encode()).transpose()?;
    let deps = deps.map(|deps| deps.encode().map(|bytes| (deps, bytes))).transpose()?;
    Ok(Encoded { path: normalize_path(&post.path), post, data, search, deps })
}

/// Serialize a batch, spread over the blocking pool when it's large enough.
/// Output order matches input order.
async fn encode_batch(items: Vec<Pending>) -> Result<Vec<Encoded>> {
    if items.len() < PARALLEL_ENCODE_MIN {
        return items.into_iter().map(encode_one).collect();
    }
    let workers = std::thread::available_parallelism().map(usize::from).unwrap_or(1);
    let chunk_size = items.len().div_ceil(workers);
    let total = items.len();
    let mut items = items.into_iter().peekable();
    let mut handles = Vec::with_capacity(workers);
    while items.peek().is_some() {
        let chunk: Vec<Pending> = items.by_ref().take(chunk_size).collect();
        handles.push(tokio::task::spawn_blocking(move || chunk.into_iter().map(encode_one).collect::<Result<Vec<_>>>()));
    }
    let mut encoded = Vec::with_capacity(total);
    for handle in handles {
        encoded.extend(handle.await.or_raise(|| ErrorKind::Task)??);
    }
    Ok(encoded)
}

/// Read a record, treating one that no longer decodes as absent.
async fn read_lenient<T: Record>(conn: &mut SqliteConnection, bucket: Bucket, key: &str) -> Result<Option<T>> {
    let Some(bytes) = bucket::get_raw(&mut *conn, bucket, key).await? else {
        return Ok(None);
    };
    match T::decode(&bytes) {
        Ok(record) => Ok(Some(record)),
        Err(err) => {
            tracing::warn!(%bucket, key, error = %err, "ignoring undecodable record");
            Ok(None)
        },
    }
}

/// Drop the mapping for `path`, but only if it still points at `post_id`.
async fn release_path(conn: &mut SqliteConnection, path: &str, post_id: &str) -> Result<()> {
    let owner = bucket::get_raw(&mut *conn, Bucket::Paths, path).await?;
    if owner.as_deref() == Some(post_id.as_bytes()) {
        bucket::delete(&mut *conn, Bucket::Paths, path).await?;
    }
    Ok(())
}

impl CacheManager {
    /// Write a batch of posts, with their search and dependency records, in a
    /// single transaction.
    ///
    /// Index keys and path mappings left over from a previous version of a
    /// post are removed in the same transaction. A post whose path is taken
    /// over by a different id is deleted. The build counters are bumped as
    /// part of the commit.
    ///
    /// Search and dependency records are matched to posts by id; any without
    /// a post in the batch are ignored. A post committed without dependencies
    /// keeps the ones stored before.
    #[instrument(skip_all, fields(posts = posts.len()))]
    pub async fn batch_commit(
        &self,
        posts: Vec<PostMeta>,
        mut search: HashMap<String, SearchRecord>,
        mut deps: HashMap<String, Dependencies>,
    ) -> Result<()> {
        if posts.is_empty() {
            return Ok(());
        }
        let pending: Vec<Pending> = posts
            .into_iter()
            .map(|post| {
                let search = search.remove(&post.post_id);
                let deps = deps.remove(&post.post_id);
                (post, search, deps)
            })
            .collect();
        if !search.is_empty() || !deps.is_empty() {
            tracing::debug!(search = search.len(), deps = deps.len(), "ignoring records without a post in the batch");
        }
        let encoded = encode_batch(pending).await?;

        let batch: HashMap<&str, &str> =
            encoded.iter().map(|item| (item.post.post_id.as_str(), item.path.as_str())).collect();
        let mut touched = Vec::with_capacity(encoded.len());
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        for item in &encoded {
            Self::write_post(&mut tx, item, &batch, &mut touched).await?;
        }
        Self::bump_build_counters(&mut tx).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;

        self.memo().invalidate(touched.iter().map(|(id, path)| (id.as_str(), path.as_str())));
        tracing::info!("committed batch");
        Ok(())
    }

    /// `batch` maps every post id in the current commit to its new path.
    async fn write_post(
        conn: &mut SqliteConnection,
        item: &Encoded,
        batch: &HashMap<&str, &str>,
        touched: &mut Vec<(String, String)>,
    ) -> Result<()> {
        let id = item.post.post_id.as_str();
        touched.push((id.to_string(), item.path.clone()));

        // Paths map to exactly one post. A previous owner that moves elsewhere
        // in this batch only gives up the path; any other owner is gone.
        if let Some(owner) = bucket::get_string(&mut *conn, Bucket::Paths, &item.path).await? {
            if owner != id {
                match batch.get(owner.as_str()) {
                    Some(&moved_to) if moved_to != item.path => {
                        tracing::debug!(path = %item.path, previous = %owner, moved_to, "path handed over within batch");
                        bucket::delete(&mut *conn, Bucket::Paths, &item.path).await?;
                        touched.push((owner, item.path.clone()));
                    },
                    _ => {
                        tracing::debug!(path = %item.path, previous = %owner, "path changed owner");
                        Self::remove_post(conn, &owner, touched).await?;
                    },
                }
            }
        }

        let previous: Option<PostMeta> = read_lenient(conn, Bucket::Posts, id).await?;
        let previous_deps: Option<Dependencies> = read_lenient(conn, Bucket::PostDeps, id).await?;
        let deps = item.deps.as_ref().map(|(deps, _)| deps).or(previous_deps.as_ref());
        let keys = index::keys_for(&item.post, deps);
        if let Some(previous) = &previous {
            let stale = index::keys_for(previous, previous_deps.as_ref());
            index::delete_all(conn, stale.difference(&keys)).await?;
            let old_path = normalize_path(&previous.path);
            if old_path != item.path {
                release_path(conn, &old_path, id).await?;
                touched.push((id.to_string(), old_path));
            }
        }

        bucket::put_raw(&mut *conn, Bucket::Posts, id, &item.data).await?;
        bucket::put_raw(&mut *conn, Bucket::Paths, &item.path, id.as_bytes()).await?;
        if let Some(search) = &item.search {
            bucket::put_raw(&mut *conn, Bucket::Search, id, search).await?;
        }
        if let Some((_, bytes)) = &item.deps {
            bucket::put_raw(&mut *conn, Bucket::PostDeps, id, bytes).await?;
        }
        index::insert_all(conn, &keys).await
    }

    /// Remove a post with every record and index key it owns.
    ///
    /// Deleting an unknown id is a no-op.
    #[instrument(skip(self))]
    pub async fn delete_post(&self, post_id: &str) -> Result<()> {
        let mut touched = Vec::new();
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let existed = Self::remove_post(&mut tx, post_id, &mut touched).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        self.memo().invalidate(touched.iter().map(|(id, path)| (id.as_str(), path.as_str())));
        if existed {
            tracing::debug!("deleted post");
        }
        Ok(())
    }

    async fn remove_post(conn: &mut SqliteConnection, post_id: &str, touched: &mut Vec<(String, String)>) -> Result<bool> {
        let Some(bytes) = bucket::get_raw(&mut *conn, Bucket::Posts, post_id).await? else {
            return Ok(false);
        };
        let deps: Option<Dependencies> = read_lenient(conn, Bucket::PostDeps, post_id).await?;
        match PostMeta::decode(&bytes) {
            Ok(post) => {
                let path = normalize_path(&post.path);
                index::delete_all(conn, &index::keys_for(&post, deps.as_ref())).await?;
                release_path(conn, &path, post_id).await?;
                touched.push((post_id.to_string(), path));
            },
            Err(err) => {
                // Without the record, the only way back to its path is a scan.
                tracing::warn!(post_id, error = %err, "deleting undecodable post");
                let stub = PostMeta { post_id: post_id.to_string(), ..Default::default() };
                index::delete_all(conn, &index::keys_for(&stub, deps.as_ref())).await?;
                for entry in bucket::entries(&mut *conn, Bucket::Paths, None).await? {
                    if entry.value == post_id.as_bytes() {
                        bucket::delete(&mut *conn, Bucket::Paths, &entry.key).await?;
                        touched.push((post_id.to_string(), entry.key));
                    }
                }
            },
        }
        for bucket in [Bucket::Posts, Bucket::Search, Bucket::PostDeps] {
            bucket::delete(&mut *conn, bucket, post_id).await?;
        }
        Ok(true)
    }

    /// Put rendered HTML in the content store, returning its hash.
    pub async fn store_html(&self, html: &str) -> Result<String> {
        let blob = self.store().put(HTML_CATEGORY, html.as_bytes()).await.or_raise(|| ErrorKind::Store)?;
        Ok(blob.hash)
    }

    /// Attach rendered HTML to a post: inline when small, otherwise as a
    /// reference to a content store blob.
    pub async fn store_html_for_post(&self, post: &mut PostMeta, html: String) -> Result<()> {
        post.html = Some(if html.len() < self.config().cache.inline_html_threshold {
            HtmlRef::Inline(html)
        } else {
            HtmlRef::Blob(self.store_html(&html).await?)
        });
        Ok(())
    }

    /// Record the rendered output for `(kind, input_hash)`.
    ///
    /// New content for a known `(kind, input_hash)` replaces the old record.
    /// Storing the same content again returns the existing record untouched,
    /// unless its blob has gone missing.
    #[instrument(skip(self, content), fields(size = content.len()))]
    pub async fn store_ssr(&self, kind: &str, input_hash: &str, content: &[u8]) -> Result<SsrArtifact> {
        let key = SsrArtifact::key(kind, input_hash);
        let category = SsrArtifact::category(kind);
        let existing: Option<SsrArtifact> = {
            let mut conn = self.db().pool().acquire().await.or_raise(|| ErrorKind::Database)?;
            read_lenient(&mut conn, Bucket::Ssr, &key).await?
        };
        if let Some(existing) = existing.as_ref().filter(|existing| existing.output_hash == hash_bytes(content)) {
            if self.store().exists(&category, &existing.output_hash).await.or_raise(|| ErrorKind::Store)? {
                return Ok(existing.clone());
            }
            tracing::warn!(output = %existing.output_hash, "artifact blob missing, storing again");
        }

        let blob = self.store().put(&category, content).await.or_raise(|| ErrorKind::Store)?;
        let artifact = SsrArtifact {
            kind: kind.to_string(),
            input_hash: input_hash.to_string(),
            output_hash: blob.hash,
            ref_count: existing.map_or(0, |existing| existing.ref_count),
            size: content.len() as u64,
            created_at: OffsetDateTime::now_utc(),
            compressed: blob.compression.is_compressed(),
        };
        bucket::put(self.db().pool(), Bucket::Ssr, &key, &artifact).await?;
        Ok(artifact)
    }
}
