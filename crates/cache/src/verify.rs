//! Consistency checks between `meta.db` and the content store.
//!
//! Verification never repairs anything and never stops at the first
//! problem: it returns every [`Finding`] and leaves the decision (usually a
//! rebuild) to the caller.

use crate::CacheManager;
use crate::bucket::{self, Bucket};
use crate::error::{ErrorKind, Result};
use crate::hash::normalize_path;
use crate::manager::HTML_CATEGORY;
use crate::models::{PostMeta, Record, SsrArtifact};
use derive_more::Display;
use exn::ResultExt;
use kosh_store::Blob;
use std::collections::HashMap;
use tracing::instrument;

// Enough to hold any compression magic number.
const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, PartialEq, Eq, Display)]
pub enum Finding {
    #[display("post {post_id}: record does not decode")]
    CorruptPost { post_id: String },
    #[display("post {post_id}: record carries id {recorded}")]
    PostIdMismatch { post_id: String, recorded: String },
    #[display("post {post_id}: no path mapping for {path}")]
    MissingPathMapping { post_id: String, path: String },
    #[display("post {post_id}: {path} maps to {mapped}")]
    PathMappingMismatch { post_id: String, path: String, mapped: String },
    #[display("path {path}: maps to missing post {post_id}")]
    DanglingPathMapping { path: String, post_id: String },
    #[display("post {post_id}: html blob {hash} is missing")]
    MissingHtmlBlob { post_id: String, hash: String },
    #[display("artifact {key}: record does not decode")]
    CorruptArtifact { key: String },
    #[display("artifact {key}: output blob {hash} is missing")]
    MissingSsrBlob { key: String, hash: String },
    /// The artifact says compressed, the file extension says otherwise (or
    /// the reverse).
    #[display("artifact {key}: blob {hash} is stored as {stored}")]
    BlobExtensionMismatch { key: String, hash: String, stored: String },
    /// The file's first bytes disagree with its extension.
    #[display("{category}/{hash}: content does not match its extension")]
    BlobHeaderMismatch { category: String, hash: String },
    #[display("{category}/{hash}: {reason}")]
    UnreadableBlob { category: String, hash: String, reason: String },
}

impl CacheManager {
    /// Check the first posts (as many as `cache.quick_verify_samples`) for
    /// decode errors and missing HTML blobs. Cheap enough for every build.
    #[instrument(skip(self))]
    pub async fn quick_verify(&self) -> Result<Vec<Finding>> {
        let samples = self.config().cache.quick_verify_samples;
        let entries = bucket::entries(self.db().pool(), Bucket::Posts, Some(samples)).await?;
        let mut findings = Vec::new();
        for entry in entries {
            match PostMeta::decode(&entry.value) {
                Ok(post) => findings.extend(self.check_html(&entry.key, &post, false).await),
                Err(_) => findings.push(Finding::CorruptPost { post_id: entry.key }),
            }
        }
        Ok(findings)
    }

    /// Check every post and every SSR artifact.
    #[instrument(skip(self))]
    pub async fn verify(&self) -> Result<Vec<Finding>> {
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let posts = bucket::entries(&mut *tx, Bucket::Posts, None).await?;
        let paths = bucket::entries(&mut *tx, Bucket::Paths, None).await?;
        let artifacts = bucket::entries(&mut *tx, Bucket::Ssr, None).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;

        let mut findings = Vec::new();
        let paths: HashMap<String, String> = paths
            .into_iter()
            .map(|entry| (entry.key, String::from_utf8_lossy(&entry.value).into_owned()))
            .collect();
        let mut known_ids = std::collections::HashSet::with_capacity(posts.len());

        for entry in posts {
            known_ids.insert(entry.key.clone());
            let post = match PostMeta::decode(&entry.value) {
                Ok(post) => post,
                Err(_) => {
                    findings.push(Finding::CorruptPost { post_id: entry.key });
                    continue;
                },
            };
            if post.post_id != entry.key {
                findings.push(Finding::PostIdMismatch { post_id: entry.key.clone(), recorded: post.post_id.clone() });
            }
            let path = normalize_path(&post.path);
            match paths.get(&path) {
                None => findings.push(Finding::MissingPathMapping { post_id: entry.key.clone(), path }),
                Some(mapped) if *mapped != entry.key => findings.push(Finding::PathMappingMismatch {
                    post_id: entry.key.clone(),
                    path,
                    mapped: mapped.clone(),
                }),
                Some(_) => {},
            }
            findings.extend(self.check_html(&entry.key, &post, true).await);
        }

        for (path, post_id) in &paths {
            if !known_ids.contains(post_id) {
                findings.push(Finding::DanglingPathMapping { path: path.clone(), post_id: post_id.clone() });
            }
        }

        for entry in artifacts {
            match SsrArtifact::decode(&entry.value) {
                Ok(artifact) => findings.extend(self.check_artifact(entry.key, &artifact).await),
                Err(_) => findings.push(Finding::CorruptArtifact { key: entry.key }),
            }
        }

        if findings.is_empty() {
            tracing::debug!("cache is consistent");
        } else {
            tracing::warn!(findings = findings.len(), "cache verification found problems");
        }
        Ok(findings)
    }

    async fn check_html(&self, post_id: &str, post: &PostMeta, deep: bool) -> Option<Finding> {
        let hash = post.html_hash()?;
        match self.store().locate(HTML_CATEGORY, hash).await {
            Ok(None) => Some(Finding::MissingHtmlBlob { post_id: post_id.to_string(), hash: hash.to_string() }),
            Ok(Some(blob)) if deep => self.check_header(HTML_CATEGORY, &blob).await,
            Ok(Some(_)) => None,
            Err(err) => Some(Finding::UnreadableBlob {
                category: HTML_CATEGORY.to_string(),
                hash: hash.to_string(),
                reason: err.to_string(),
            }),
        }
    }

    async fn check_artifact(&self, key: String, artifact: &SsrArtifact) -> Option<Finding> {
        let category = SsrArtifact::category(&artifact.kind);
        let hash = artifact.output_hash.clone();
        let blob = match self.store().locate(&category, &hash).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return Some(Finding::MissingSsrBlob { key, hash }),
            Err(err) => return Some(Finding::UnreadableBlob { category, hash, reason: err.to_string() }),
        };
        if blob.compression.is_compressed() != artifact.compressed {
            return Some(Finding::BlobExtensionMismatch { key, hash, stored: blob.compression.to_string() });
        }
        self.check_header(&category, &blob).await
    }

    async fn check_header(&self, category: &str, blob: &Blob) -> Option<Finding> {
        match self.store().read_head(category, &blob.hash, blob.compression, HEADER_LEN).await {
            Ok(Some(head)) if blob.compression.check_magic_bytes(&head) => None,
            Ok(Some(_)) => Some(Finding::BlobHeaderMismatch { category: category.to_string(), hash: blob.hash.clone() }),
            // Deleted between locate and read.
            Ok(None) => None,
            Err(err) => Some(Finding::UnreadableBlob {
                category: category.to_string(),
                hash: blob.hash.clone(),
                reason: err.to_string(),
            }),
        }
    }
}
