//! Named key-value buckets on top of the `entries` table.
//!
//! All SQL the cache runs lives here. Callers pass any SQLite executor: the
//! pool for one-off reads, or `&mut *tx` to take part in a transaction.

use crate::error::{ErrorKind, Result};
use crate::models::Record;
use exn::ResultExt;
use sqlx::SqliteExecutor;
use std::fmt;

/// A key-value namespace inside `meta.db`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Bucket {
    /// post id → [`PostMeta`](crate::PostMeta)
    Posts,
    /// normalized source path → post id
    Paths,
    /// post id → [`SearchRecord`](crate::SearchRecord)
    Search,
    /// post id → [`Dependencies`](crate::Dependencies)
    PostDeps,
    /// `{kind}:{input_hash}` → [`SsrArtifact`](crate::SsrArtifact)
    Ssr,
    /// source path → social card hash
    SocialCard,
    /// `{tag}/{post id}` → empty
    Tags,
    /// `{template}/{post id}` → empty
    Templates,
    /// `{include}/{post id}` → empty
    Includes,
    Meta,
    Stats,
}
impl Bucket {
    pub const ALL: [Bucket; 11] = [
        Bucket::Posts,
        Bucket::Paths,
        Bucket::Search,
        Bucket::PostDeps,
        Bucket::Ssr,
        Bucket::SocialCard,
        Bucket::Tags,
        Bucket::Templates,
        Bucket::Includes,
        Bucket::Meta,
        Bucket::Stats,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Posts => "posts",
            Bucket::Paths => "paths",
            Bucket::Search => "search",
            Bucket::PostDeps => "post_deps",
            Bucket::Ssr => "ssr",
            Bucket::SocialCard => "social_card",
            Bucket::Tags => "tags",
            Bucket::Templates => "deps_templates",
            Bucket::Includes => "deps_includes",
            Bucket::Meta => "meta",
            Bucket::Stats => "stats",
        }
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct Entry {
    pub key: String,
    pub value: Vec<u8>,
}

/// Smallest string greater than every string starting with `prefix`.
///
/// Keys compare bytewise, and UTF-8 preserves code point order, so bumping
/// the last character is enough. `None` means "no upper bound".
fn prefix_end(prefix: &str) -> Option<String> {
    let mut chars: Vec<char> = prefix.chars().collect();
    while let Some(last) = chars.pop() {
        // Skip the surrogate gap; char::from_u32 rejects it.
        let next = (last as u32 + 1..=char::MAX as u32).find_map(char::from_u32);
        if let Some(next) = next {
            chars.push(next);
            return Some(chars.into_iter().collect());
        }
    }
    None
}

pub(crate) async fn register<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket) -> Result<()> {
    sqlx::query(include_str!("../queries/register_bucket.sql"))
        .bind(bucket.name())
        .execute(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

pub(crate) async fn get_raw<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str) -> Result<Option<Vec<u8>>> {
    sqlx::query_scalar(include_str!("../queries/get_entry.sql"))
        .bind(bucket.name())
        .bind(key)
        .fetch_optional(exec)
        .await
        .or_raise(|| ErrorKind::Database)
}

/// Decode the record stored at `key`. A miss is `Ok(None)`; a record that
/// fails to decode is an error.
pub(crate) async fn get<'c, T: Record>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str) -> Result<Option<T>> {
    get_raw(exec, bucket, key).await?.map(|bytes| T::decode(&bytes)).transpose()
}

pub(crate) async fn get_string<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str) -> Result<Option<String>> {
    get_raw(exec, bucket, key)
        .await?
        .map(|bytes| String::from_utf8(bytes).or_raise(|| ErrorKind::InvalidData("utf-8 value")))
        .transpose()
}

pub(crate) async fn get_u64<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str) -> Result<Option<u64>> {
    get_raw(exec, bucket, key)
        .await?
        .map(|bytes| {
            let array = <[u8; 8]>::try_from(bytes.as_slice()).or_raise(|| ErrorKind::InvalidData("counter"))?;
            Ok(u64::from_be_bytes(array))
        })
        .transpose()
}

pub(crate) async fn put_raw<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str, value: &[u8]) -> Result<()> {
    sqlx::query(include_str!("../queries/put_entry.sql"))
        .bind(bucket.name())
        .bind(key)
        .bind(value)
        .execute(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(())
}

pub(crate) async fn put<'c, T: Record>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str, record: &T) -> Result<()> {
    put_raw(exec, bucket, key, &record.encode()?).await
}

pub(crate) async fn put_u64<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str, value: u64) -> Result<()> {
    put_raw(exec, bucket, key, &value.to_be_bytes()).await
}

/// Insert unless the key already exists. Returns whether a row was written.
pub(crate) async fn insert_if_absent<'c>(
    exec: impl SqliteExecutor<'c>,
    bucket: Bucket,
    key: &str,
    value: &[u8],
) -> Result<bool> {
    let result = sqlx::query(include_str!("../queries/insert_entry_if_absent.sql"))
        .bind(bucket.name())
        .bind(key)
        .bind(value)
        .execute(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected() > 0)
}

/// Delete `key`. Returns whether it existed.
pub(crate) async fn delete<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, key: &str) -> Result<bool> {
    let result = sqlx::query(include_str!("../queries/delete_entry.sql"))
        .bind(bucket.name())
        .bind(key)
        .execute(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    Ok(result.rows_affected() > 0)
}

/// Every entry whose key starts with `prefix`, in key order.
pub(crate) async fn scan_prefix<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, prefix: &str) -> Result<Vec<Entry>> {
    let query = match prefix_end(prefix) {
        Some(end) => sqlx::query_as(include_str!("../queries/scan_range.sql"))
            .bind(bucket.name())
            .bind(prefix.to_string())
            .bind(end),
        None => sqlx::query_as(include_str!("../queries/scan_from.sql"))
            .bind(bucket.name())
            .bind(prefix.to_string()),
    };
    query.fetch_all(exec).await.or_raise(|| ErrorKind::Database)
}

/// All entries in key order, optionally only the first `limit`.
pub(crate) async fn entries<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket, limit: Option<usize>) -> Result<Vec<Entry>> {
    // SQLite treats a negative LIMIT as "no limit".
    let limit = match limit {
        Some(n) => i64::try_from(n).or_raise(|| ErrorKind::InvalidData("limit"))?,
        None => -1,
    };
    sqlx::query_as(include_str!("../queries/list_entries.sql"))
        .bind(bucket.name())
        .bind(limit)
        .fetch_all(exec)
        .await
        .or_raise(|| ErrorKind::Database)
}

pub(crate) async fn count<'c>(exec: impl SqliteExecutor<'c>, bucket: Bucket) -> Result<u64> {
    let count: i64 = sqlx::query_scalar(include_str!("../queries/count_entries.sql"))
        .bind(bucket.name())
        .fetch_one(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    u64::try_from(count).or_raise(|| ErrorKind::InvalidData("count"))
}

/// Path → id → record in a single statement, so both lookups see the same snapshot.
pub(crate) async fn post_by_path<'c, T: Record>(exec: impl SqliteExecutor<'c>, path: &str) -> Result<Option<T>> {
    let bytes: Option<Vec<u8>> = sqlx::query_scalar(include_str!("../queries/get_post_by_path.sql"))
        .bind(path)
        .fetch_optional(exec)
        .await
        .or_raise(|| ErrorKind::Database)?;
    bytes.map(|b| T::decode(&b)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use crate::models::Dependencies;
    use rstest::rstest;

    #[rstest]
    #[case("go/", Some("go0"))]
    #[case("a", Some("b"))]
    #[case("", None)]
    #[case("caf\u{e9}/", Some("caf\u{e9}0"))]
    #[case("x\u{d7ff}", Some("x\u{e000}"))]
    fn test_prefix_end(#[case] prefix: &str, #[case] expected: Option<&str>) {
        assert_eq!(prefix_end(prefix).as_deref(), expected);
    }

    #[test]
    fn test_bucket_names_are_unique() {
        let mut names: Vec<_> = Bucket::ALL.iter().map(Bucket::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), Bucket::ALL.len());
        assert_eq!(Bucket::Templates.to_string(), Bucket::Templates.name());
    }

    #[tokio::test]
    async fn test_get_put_delete() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = db.pool();
        assert!(get_raw(pool, Bucket::Meta, "k").await.unwrap().is_none());
        put_raw(pool, Bucket::Meta, "k", b"v1").await.unwrap();
        put_raw(pool, Bucket::Meta, "k", b"v2").await.unwrap();
        assert_eq!(get_raw(pool, Bucket::Meta, "k").await.unwrap().unwrap(), b"v2");
        // Same key, different bucket.
        assert!(get_raw(pool, Bucket::Stats, "k").await.unwrap().is_none());
        assert!(delete(pool, Bucket::Meta, "k").await.unwrap());
        assert!(!delete(pool, Bucket::Meta, "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_typed_records() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = db.pool();
        let deps = Dependencies { templates: vec!["post.html".into()], ..Default::default() };
        put(pool, Bucket::PostDeps, "id1", &deps).await.unwrap();
        assert_eq!(get::<Dependencies>(pool, Bucket::PostDeps, "id1").await.unwrap(), Some(deps));

        put_raw(pool, Bucket::PostDeps, "broken", b"\xff\x00").await.unwrap();
        let err = get::<Dependencies>(pool, Bucket::PostDeps, "broken").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData(_)));
    }

    #[tokio::test]
    async fn test_counters_and_insert_if_absent() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = db.pool();
        assert_eq!(get_u64(pool, Bucket::Stats, "n").await.unwrap(), None);
        put_u64(pool, Bucket::Stats, "n", 42).await.unwrap();
        assert_eq!(get_u64(pool, Bucket::Stats, "n").await.unwrap(), Some(42));
        put_raw(pool, Bucket::Stats, "short", b"abc").await.unwrap();
        let err = get_u64(pool, Bucket::Stats, "short").await.unwrap_err();
        assert!(matches!(&*err, ErrorKind::InvalidData("counter")));

        assert!(insert_if_absent(pool, Bucket::Meta, "once", b"first").await.unwrap());
        assert!(!insert_if_absent(pool, Bucket::Meta, "once", b"second").await.unwrap());
        assert_eq!(get_string(pool, Bucket::Meta, "once").await.unwrap().unwrap(), "first");
    }

    #[tokio::test]
    async fn test_scan_prefix_stops_at_boundary() {
        let db = Database::connect_in_memory().await.unwrap();
        let pool = db.pool();
        for key in ["go/1", "go/2", "go0", "golang/3", "g/4", "go-x/5"] {
            put_raw(pool, Bucket::Tags, key, b"").await.unwrap();
        }
        let keys: Vec<String> =
            scan_prefix(pool, Bucket::Tags, "go/").await.unwrap().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["go/1", "go/2"]);
        assert_eq!(scan_prefix(pool, Bucket::Tags, "").await.unwrap().len(), 6);
        assert_eq!(count(pool, Bucket::Tags).await.unwrap(), 6);
        assert_eq!(entries(pool, Bucket::Tags, Some(2)).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_writes_roll_back_with_transaction() {
        let db = Database::connect_in_memory().await.unwrap();
        let mut tx = db.pool().begin().await.unwrap();
        put_raw(&mut *tx, Bucket::Meta, "k", b"v").await.unwrap();
        tx.rollback().await.unwrap();
        assert!(get_raw(db.pool(), Bucket::Meta, "k").await.unwrap().is_none());
    }
}
