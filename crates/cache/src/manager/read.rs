use super::{CacheManager, HTML_CATEGORY};
use crate::bucket::{self, Bucket};
use crate::error::{ErrorKind, Result};
use crate::hash::normalize_path;
use crate::index::{self, IndexKind};
use crate::memo::ReadCache;
use crate::models::{Dependencies, HtmlRef, PostListMeta, PostMeta, Record, SearchRecord, SsrArtifact};
use exn::ResultExt;
use std::collections::HashMap;
use tracing::instrument;

impl CacheManager {
    /// Look up a post by id. A missing post is `Ok(None)`.
    pub async fn post_by_id(&self, post_id: &str) -> Result<Option<PostMeta>> {
        let memo_key = ReadCache::id_key(post_id);
        if let Some(post) = self.memo().get(&memo_key) {
            return Ok(Some(post));
        }
        let post: Option<PostMeta> = bucket::get(self.db().pool(), Bucket::Posts, post_id).await?;
        if let Some(post) = &post {
            self.memo().insert(memo_key, post);
        }
        Ok(post)
    }

    /// Look up a post by its source path. The path is normalized first, so
    /// `./a.md` and `a.md` find the same post.
    pub async fn post_by_path(&self, path: &str) -> Result<Option<PostMeta>> {
        let path = normalize_path(path);
        let memo_key = ReadCache::path_key(&path);
        if let Some(post) = self.memo().get(&memo_key) {
            return Ok(Some(post));
        }
        let post: Option<PostMeta> = bucket::post_by_path(self.db().pool(), &path).await?;
        if let Some(post) = &post {
            self.memo().insert(memo_key, post);
        }
        Ok(post)
    }

    /// Fetch many posts in one read transaction.
    ///
    /// Missing ids are left out, and so are records that fail to decode: one
    /// corrupt post should cost a re-render of that post, not the batch.
    #[instrument(skip_all, fields(requested = ids.len()))]
    pub async fn posts_by_ids(&self, ids: &[String]) -> Result<Vec<PostMeta>> {
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let mut posts = Vec::with_capacity(ids.len());
        for id in ids {
            let Some(bytes) = bucket::get_raw(&mut *tx, Bucket::Posts, id).await? else {
                continue;
            };
            match PostMeta::decode(&bytes) {
                Ok(post) => posts.push(post),
                Err(err) => tracing::warn!(post_id = %id, error = %err, "skipping undecodable post"),
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(posts)
    }

    pub async fn search_record(&self, post_id: &str) -> Result<Option<SearchRecord>> {
        bucket::get(self.db().pool(), Bucket::Search, post_id).await
    }

    /// Search records for the given posts, keyed by post id.
    pub async fn search_records(&self, ids: &[String]) -> Result<HashMap<String, SearchRecord>> {
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let mut records = HashMap::with_capacity(ids.len());
        for id in ids {
            let Some(bytes) = bucket::get_raw(&mut *tx, Bucket::Search, id).await? else {
                continue;
            };
            match SearchRecord::decode(&bytes) {
                Ok(record) => {
                    records.insert(id.clone(), record);
                },
                Err(err) => tracing::warn!(post_id = %id, error = %err, "skipping undecodable search record"),
            }
        }
        tx.commit().await.or_raise(|| ErrorKind::Database)?;
        Ok(records)
    }

    pub async fn dependencies(&self, post_id: &str) -> Result<Option<Dependencies>> {
        bucket::get(self.db().pool(), Bucket::PostDeps, post_id).await
    }

    pub async fn ssr_artifact(&self, kind: &str, input_hash: &str) -> Result<Option<SsrArtifact>> {
        bucket::get(self.db().pool(), Bucket::Ssr, &SsrArtifact::key(kind, input_hash)).await
    }

    pub async fn posts_by_tag(&self, tag: &str) -> Result<Vec<String>> {
        self.posts_by(IndexKind::Tag, tag).await
    }

    pub async fn posts_by_template(&self, template: &str) -> Result<Vec<String>> {
        self.posts_by(IndexKind::Template, template).await
    }

    pub async fn posts_by_include(&self, include: &str) -> Result<Vec<String>> {
        self.posts_by(IndexKind::Include, include).await
    }

    /// Ids of every post indexed under `value`, in id order.
    pub async fn posts_by(&self, kind: IndexKind, value: &str) -> Result<Vec<String>> {
        index::lookup(self.db().pool(), kind, value).await
    }

    /// Every post in the cache, skipping records that fail to decode.
    pub async fn list_all_posts(&self) -> Result<Vec<PostMeta>> {
        let entries = bucket::entries(self.db().pool(), Bucket::Posts, None).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match PostMeta::decode(&entry.value) {
                Ok(post) => Some(post),
                Err(err) => {
                    tracing::warn!(post_id = %entry.key, error = %err, "skipping undecodable post");
                    None
                },
            })
            .collect())
    }

    /// Listing data for the posts of one documentation version.
    pub async fn posts_metadata_by_version(&self, version: &str) -> Result<Vec<PostListMeta>> {
        Ok(self
            .list_all_posts()
            .await?
            .iter()
            .filter(|post| post.version == version)
            .map(PostListMeta::from)
            .collect())
    }

    /// Rendered HTML of a post, wherever it is stored.
    ///
    /// `Ok(None)` if the post has no HTML or its blob is gone.
    pub async fn html_content(&self, post: &PostMeta) -> Result<Option<String>> {
        match &post.html {
            None => Ok(None),
            Some(HtmlRef::Inline(html)) => Ok(Some(html.clone())),
            Some(HtmlRef::Blob(hash)) => {
                let compressed = match self.store().locate(HTML_CATEGORY, hash).await.or_raise(|| ErrorKind::Store)? {
                    Some(blob) => blob.compression.is_compressed(),
                    None => return Ok(None),
                };
                let bytes = self.store().get(HTML_CATEGORY, hash, compressed).await.or_raise(|| ErrorKind::Store)?;
                bytes
                    .map(|bytes| String::from_utf8(bytes).or_raise(|| ErrorKind::InvalidData("html")))
                    .transpose()
            },
        }
    }

    /// Rendered output of an SSR artifact, decompressed.
    pub async fn ssr_content(&self, artifact: &SsrArtifact) -> Result<Option<Vec<u8>>> {
        self.store()
            .get(&SsrArtifact::category(&artifact.kind), &artifact.output_hash, artifact.compressed)
            .await
            .or_raise(|| ErrorKind::Store)
    }
}
