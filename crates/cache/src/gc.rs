//! Mark-and-sweep collection of unreachable content store blobs.
//!
//! Reachability is always derived from the records in `meta.db`: HTML blobs
//! are live while a post references them, SSR outputs are live while their
//! artifact record exists. Reference counts on artifacts are reconciled at
//! the end of a collection but never consulted to decide what to delete.
//!
//! Collection assumes no build is committing at the same time; a blob written
//! after the mark phase but before its post is committed would look orphaned.

use crate::CacheManager;
use crate::bucket::{self, Bucket};
use crate::error::{ErrorKind, Result};
use crate::manager::{
    HTML_CATEGORY, KEY_BUILDS_SINCE_GC, KEY_DEAD_BYTES, KEY_LAST_GC, KEY_STORE_BYTES, SSR_CATEGORY,
};
use crate::models::{PostMeta, Record, SsrArtifact};
use derive_more::Display;
use exn::ResultExt;
use futures::StreamExt;
pub use kosh_config::GcSettings;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::task::JoinSet;
use tracing::instrument;

/// Whether a collection is worth running now.
#[derive(Debug, Clone, PartialEq)]
pub enum GcDecision {
    Run { dead_ratio: f64 },
    Skip(SkipReason),
}
impl GcDecision {
    pub fn should_run(&self) -> bool {
        matches!(self, GcDecision::Run { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Display)]
pub enum SkipReason {
    #[display("{builds_since_gc} of {min_builds} builds since the last collection")]
    TooSoon { builds_since_gc: u64, min_builds: u64 },
    /// No dry run has recorded how much of the store is dead.
    #[display("no dead bytes estimate")]
    NoEstimate,
    #[display("dead ratio {dead_ratio:.2} below {threshold:.2}")]
    BelowThreshold { dead_ratio: f64, threshold: f64 },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GcReport {
    pub dry_run: bool,
    /// Distinct blobs found on disk
    pub scanned: usize,
    pub live: usize,
    pub orphaned: usize,
    /// On-disk size of the orphans, whether or not they were deleted
    pub orphaned_bytes: u64,
    pub deleted: usize,
    pub deleted_bytes: u64,
    /// Orphans that could not be deleted; they are retried next time.
    pub failed: usize,
    /// Records skipped during marking because they no longer decode
    pub skipped_records: usize,
    pub duration: Duration,
}

/// Output of the mark phase.
#[derive(Debug, Default)]
struct Marked {
    /// Category → hashes that must survive
    live: HashMap<String, HashSet<String>>,
    artifacts: Vec<(String, SsrArtifact)>,
    skipped: usize,
    /// SSR input hash → number of posts referencing it
    references: HashMap<String, u32>,
}

/// What one category scan found on disk.
struct Scanned {
    category: String,
    live: HashSet<String>,
    /// Hash → bytes on disk, summed over both extensions
    blobs: BTreeMap<String, u64>,
}

impl CacheManager {
    /// Propose a collection once enough builds have passed and the last
    /// recorded estimate says enough of the store is dead.
    pub async fn should_run_gc(&self, settings: &GcSettings) -> Result<GcDecision> {
        let mut conn = self.db().pool().acquire().await.or_raise(|| ErrorKind::Database)?;
        let builds_since_gc = bucket::get_u64(&mut *conn, Bucket::Stats, KEY_BUILDS_SINCE_GC).await?.unwrap_or(0);
        if builds_since_gc < settings.min_builds {
            return Ok(GcDecision::Skip(SkipReason::TooSoon { builds_since_gc, min_builds: settings.min_builds }));
        }
        let dead = bucket::get_u64(&mut *conn, Bucket::Stats, KEY_DEAD_BYTES).await?;
        let total = bucket::get_u64(&mut *conn, Bucket::Stats, KEY_STORE_BYTES).await?;
        let (Some(dead), Some(total)) = (dead, total) else {
            return Ok(GcDecision::Skip(SkipReason::NoEstimate));
        };
        let dead_ratio = if total == 0 { 0.0 } else { dead as f64 / total as f64 };
        if total > 0 && dead_ratio > settings.dead_bytes_threshold {
            Ok(GcDecision::Run { dead_ratio })
        } else {
            Ok(GcDecision::Skip(SkipReason::BelowThreshold { dead_ratio, threshold: settings.dead_bytes_threshold }))
        }
    }

    /// Delete every blob no record refers to.
    ///
    /// With `dry_run`, nothing in the store is touched: the orphans are only
    /// counted and the dead/total byte estimate used by
    /// [`should_run_gc`](Self::should_run_gc) is recorded.
    #[instrument(skip_all, fields(dry_run = settings.dry_run, orphaned = tracing::field::Empty))]
    pub async fn run_gc(&self, settings: &GcSettings) -> Result<GcReport> {
        let started = Instant::now();
        let mut report = GcReport { dry_run: settings.dry_run, ..Default::default() };

        let marked = self.mark().await?;
        report.skipped_records = marked.skipped;
        let scanned = self.scan(marked.live.clone()).await?;

        let mut total_bytes = 0;
        let mut orphans = Vec::new();
        for scan in scanned {
            for (hash, size) in scan.blobs {
                report.scanned += 1;
                total_bytes += size;
                if scan.live.contains(&hash) {
                    report.live += 1;
                } else {
                    report.orphaned += 1;
                    report.orphaned_bytes += size;
                    orphans.push((scan.category.clone(), hash));
                }
            }
        }

        tracing::Span::current().record("orphaned", report.orphaned);

        if settings.dry_run {
            let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
            bucket::put_u64(&mut *tx, Bucket::Stats, KEY_DEAD_BYTES, report.orphaned_bytes).await?;
            bucket::put_u64(&mut *tx, Bucket::Stats, KEY_STORE_BYTES, total_bytes).await?;
            tx.commit().await.or_raise(|| ErrorKind::Database)?;
        } else {
            self.sweep(&orphans, &mut report).await;
            self.reconcile(&marked).await?;
        }

        report.duration = started.elapsed();
        tracing::info!(
            scanned = report.scanned,
            orphaned = report.orphaned,
            deleted = report.deleted,
            deleted_bytes = report.deleted_bytes,
            failed = report.failed,
            "garbage collection finished"
        );
        Ok(report)
    }

    /// Collect the live set from one consistent read of posts and artifacts.
    ///
    /// Records that no longer decode are skipped: whatever they referenced
    /// can't be served from the cache anyway and gets rebuilt.
    async fn mark(&self) -> Result<Marked> {
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        let posts = bucket::entries(&mut *tx, Bucket::Posts, None).await?;
        let artifacts = bucket::entries(&mut *tx, Bucket::Ssr, None).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)?;

        let mut marked = Marked::default();
        let html = marked.live.entry(HTML_CATEGORY.to_string()).or_default();
        for entry in posts {
            let post = match PostMeta::decode(&entry.value) {
                Ok(post) => post,
                Err(err) => {
                    tracing::warn!(post_id = %entry.key, error = %err, "skipping undecodable post");
                    marked.skipped += 1;
                    continue;
                },
            };
            if let Some(hash) = post.html_hash() {
                html.insert(hash.to_string());
            }
            for input in &post.ssr_input_hashes {
                *marked.references.entry(input.clone()).or_default() += 1;
            }
        }
        for entry in artifacts {
            let artifact = match SsrArtifact::decode(&entry.value) {
                Ok(artifact) => artifact,
                Err(err) => {
                    tracing::warn!(key = %entry.key, error = %err, "skipping undecodable artifact");
                    marked.skipped += 1;
                    continue;
                },
            };
            marked
                .live
                .entry(SsrArtifact::category(&artifact.kind))
                .or_default()
                .insert(artifact.output_hash.clone());
            marked.artifacts.push((entry.key, artifact));
        }
        Ok(marked)
    }

    /// Walk every category concurrently. Returns only once all walks are done.
    async fn scan(&self, mut live: HashMap<String, HashSet<String>>) -> Result<Vec<Scanned>> {
        let mut categories: HashSet<String> = live.keys().cloned().collect();
        categories.insert(HTML_CATEGORY.to_string());
        categories.extend(self.store().subcategories(SSR_CATEGORY).await.or_raise(|| ErrorKind::Store)?);

        let mut scans = JoinSet::new();
        for category in categories {
            let store = self.store().clone();
            let live = live.remove(&category).unwrap_or_default();
            scans.spawn(async move {
                let mut blobs = BTreeMap::new();
                let mut stream = store.blobs(&category);
                while let Some(blob) = stream.next().await {
                    let blob = blob?;
                    *blobs.entry(blob.hash).or_default() += blob.size;
                }
                drop(stream);
                Ok::<_, kosh_store::error::Error>(Scanned { category, live, blobs })
            });
        }

        let mut scanned = Vec::new();
        while let Some(result) = scans.join_next().await {
            scanned.push(result.or_raise(|| ErrorKind::Task)?.or_raise(|| ErrorKind::Store)?);
        }
        Ok(scanned)
    }

    async fn sweep(&self, orphans: &[(String, String)], report: &mut GcReport) {
        for (category, hash) in orphans {
            let size = match self.store().blob_size(category, hash).await {
                Ok(size) => size,
                Err(err) => {
                    tracing::warn!(%category, %hash, error = %err, "could not stat orphaned blob");
                    report.failed += 1;
                    continue;
                },
            };
            match self.store().delete(category, hash).await {
                Ok(()) => {
                    report.deleted += 1;
                    report.deleted_bytes += size;
                },
                Err(err) => {
                    tracing::warn!(%category, %hash, error = %err, "could not delete orphaned blob");
                    report.failed += 1;
                },
            }
        }
    }

    /// Refresh artifact reference counts and reset the collection counters.
    async fn reconcile(&self, marked: &Marked) -> Result<()> {
        let mut tx = self.db().pool().begin().await.or_raise(|| ErrorKind::Database)?;
        for (key, artifact) in &marked.artifacts {
            let ref_count = marked.references.get(&artifact.input_hash).copied().unwrap_or(0);
            if ref_count != artifact.ref_count {
                let updated = SsrArtifact { ref_count, ..artifact.clone() };
                bucket::put(&mut *tx, Bucket::Ssr, key, &updated).await?;
            }
        }
        let now = u64::try_from(OffsetDateTime::now_utc().unix_timestamp()).or_raise(|| ErrorKind::InvalidData("timestamp"))?;
        bucket::put_u64(&mut *tx, Bucket::Stats, KEY_BUILDS_SINCE_GC, 0).await?;
        bucket::put_u64(&mut *tx, Bucket::Stats, KEY_LAST_GC, now).await?;
        bucket::delete(&mut *tx, Bucket::Stats, KEY_DEAD_BYTES).await?;
        bucket::delete(&mut *tx, Bucket::Stats, KEY_STORE_BYTES).await?;
        tx.commit().await.or_raise(|| ErrorKind::Database)
    }
}
