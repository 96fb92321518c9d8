//! Inverted dependency indices.
//!
//! There is no separate index store: each index is a bucket of
//! `{value}/{post id}` keys with empty values, written and pruned in the same
//! transactions as the posts they describe. "Which posts use X" is then a
//! prefix scan over `X/`.

use crate::bucket::{self, Bucket};
use crate::error::Result;
use crate::models::{Dependencies, PostMeta};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexKind {
    Tag,
    Template,
    Include,
}
impl IndexKind {
    pub(crate) fn bucket(&self) -> Bucket {
        match self {
            IndexKind::Tag => Bucket::Tags,
            IndexKind::Template => Bucket::Templates,
            IndexKind::Include => Bucket::Includes,
        }
    }
}

pub(crate) fn key(value: &str, post_id: &str) -> String {
    format!("{value}/{post_id}")
}

pub(crate) fn prefix(value: &str) -> String {
    format!("{value}/")
}

/// The full set of index keys a post contributes.
///
/// Tags come from both the post and its dependency record, so a post is
/// findable by tag whichever of the two the caller filled in.
pub(crate) fn keys_for(post: &PostMeta, deps: Option<&Dependencies>) -> BTreeSet<(IndexKind, String)> {
    let mut keys = BTreeSet::new();
    let id = post.post_id.as_str();
    for tag in &post.tags {
        keys.insert((IndexKind::Tag, key(tag, id)));
    }
    if let Some(deps) = deps {
        for tag in &deps.tags {
            keys.insert((IndexKind::Tag, key(tag, id)));
        }
        for template in &deps.templates {
            keys.insert((IndexKind::Template, key(template, id)));
        }
        for include in &deps.includes {
            keys.insert((IndexKind::Include, key(include, id)));
        }
    }
    keys
}

pub(crate) async fn insert_all(conn: &mut SqliteConnection, keys: &BTreeSet<(IndexKind, String)>) -> Result<()> {
    for (kind, key) in keys {
        bucket::put_raw(&mut *conn, kind.bucket(), key, &[]).await?;
    }
    Ok(())
}

pub(crate) async fn delete_all<'a>(
    conn: &mut SqliteConnection,
    keys: impl IntoIterator<Item = &'a (IndexKind, String)>,
) -> Result<()> {
    for (kind, key) in keys {
        bucket::delete(&mut *conn, kind.bucket(), key).await?;
    }
    Ok(())
}

/// Post ids indexed under `value`.
///
/// Values may themselves contain `/` (`partials/nav.html`), so a key only
/// counts if what follows the prefix is a bare id.
pub(crate) async fn lookup<'c>(exec: impl sqlx::SqliteExecutor<'c>, kind: IndexKind, value: &str) -> Result<Vec<String>> {
    let prefix = prefix(value);
    let entries = bucket::scan_prefix(exec, kind.bucket(), &prefix).await?;
    Ok(entries
        .into_iter()
        .filter_map(|entry| entry.key.strip_prefix(&prefix).filter(|id| !id.contains('/')).map(str::to_string))
        .collect())
}
