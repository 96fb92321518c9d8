//! Category validation and shard layout.
//!
//! Every blob lives at `<root>/<category>/<h[0:2]>/<h[2:4]>/<h>.<ext>`. The two
//! shard levels cap any single directory at 256 entries per level no matter
//! how large the corpus grows.

use crate::error::{ErrorKind, Result};
use std::path::{Component, Path, PathBuf};

/// Validates a category such as `html` or `ssr/d2`.
///
/// Categories are relative paths below the store root: `..` may not escape
/// the root, absolute and prefixed paths are rejected, and null bytes are
/// refused outright.
///
/// # Examples
///
/// ```
/// use std::path::Path;
/// use kosh_store::validate_category;
/// assert_eq!(validate_category("ssr/d2").unwrap(), Path::new("ssr/d2"));
/// assert_eq!(validate_category("./html/").unwrap(), Path::new("html"));
/// assert!(validate_category("../outside").is_err());
/// assert!(validate_category("").is_err());
/// ```
pub fn validate(category: impl AsRef<Path>) -> Result<PathBuf> {
    let category = category.as_ref();
    let mut components = Vec::new();
    for component in category.components() {
        match component {
            Component::Normal(s) => {
                // Null bytes survive Path::components() on Unix but truncate
                // in the underlying syscalls.
                if s.as_encoded_bytes().contains(&0) {
                    exn::bail!(ErrorKind::InvalidCategory(category.to_path_buf()));
                }
                components.push(s)
            },
            Component::CurDir => {},
            Component::RootDir | Component::Prefix(_) => {
                exn::bail!(ErrorKind::InvalidCategory(category.to_path_buf()))
            },
            Component::ParentDir => {
                if components.pop().is_none() {
                    exn::bail!(ErrorKind::InvalidCategory(category.to_path_buf()));
                }
            },
        }
    }
    match components.is_empty() {
        true => exn::bail!(ErrorKind::InvalidCategory(category.to_path_buf())),
        false => Ok(components.into_iter().collect()),
    }
}

/// Rejects anything that could not have come out of [`hash_bytes`](crate::hash_bytes).
pub(crate) fn validate_hash(hash: &str) -> Result<&str> {
    if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        exn::bail!(ErrorKind::InvalidHash(hash.to_string()));
    }
    Ok(hash)
}

/// Shard-relative location of a blob, without extension.
pub(crate) fn shard(category: &Path, hash: &str) -> PathBuf {
    if hash.len() < 4 {
        return category.join(hash);
    }
    category.join(&hash[0..2]).join(&hash[2..4]).join(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("html", "html")]
    #[case("ssr/d2", "ssr/d2")]
    #[case("ssr/./katex/", "ssr/katex")]
    #[case("ssr/x/../d2", "ssr/d2")]
    fn test_valid_categories(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(validate(input).unwrap(), Path::new(expected));
    }

    #[rstest]
    #[case("")]
    #[case(".")]
    #[case("/etc")]
    #[case("../html")]
    #[case("ssr/../../html")]
    #[case("ht\0ml")]
    fn test_invalid_categories(#[case] input: &str) {
        assert!(validate(input).is_err());
    }

    #[rstest]
    #[case("abcdef0123456789")]
    #[case("0")]
    fn test_valid_hashes(#[case] input: &str) {
        assert_eq!(validate_hash(input).unwrap(), input);
    }

    #[rstest]
    #[case("")]
    #[case("ABCDEF")]
    #[case("../ab")]
    #[case("ab/cd")]
    #[case("xyz")]
    fn test_invalid_hashes(#[case] input: &str) {
        assert!(validate_hash(input).is_err());
    }

    #[test]
    fn test_shard_layout() {
        assert_eq!(shard(Path::new("html"), "abcdef"), Path::new("html/ab/cd/abcdef"));
        assert_eq!(shard(Path::new("ssr/d2"), "0123"), Path::new("ssr/d2/01/23/0123"));
        assert_eq!(shard(Path::new("html"), "abc"), Path::new("html/abc"));
    }
}
