//! Hashing and identity helpers.
//!
//! Everything is BLAKE3, hex-encoded: blob addresses, post ids and record
//! fingerprints all come out of the same function.

pub use kosh_store::hash_bytes;
use unicode_normalization::UnicodeNormalization;

pub fn hash_str(s: &str) -> String {
    hash_bytes(s.as_bytes())
}

/// Canonical form of a source path, used as the `paths` bucket key and as
/// the fallback identity of a post.
///
/// Separators become `/`, a leading `./` is dropped and the string is put in
/// Unicode NFC so the same file named on different platforms compares equal.
/// Only case-insensitive platforms fold case.
pub fn normalize_path(path: &str) -> String {
    let unified: String = path.replace('\\', "/").nfc().collect();
    let mut trimmed = unified.as_str();
    while let Some(rest) = trimmed.strip_prefix("./") {
        trimmed = rest;
    }
    if cfg!(windows) { trimmed.to_lowercase() } else { trimmed.to_string() }
}

/// Stable identity of a post.
///
/// An explicit UUID from the front matter wins, so a post keeps its id when
/// moved; otherwise the id is derived from the normalized path.
pub fn post_id(uuid: Option<&str>, path: &str) -> String {
    match uuid.map(str::trim).filter(|u| !u.is_empty()) {
        Some(uuid) => hash_str(uuid),
        None => hash_str(&normalize_path(path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_hash_is_hex_blake3() {
        let hash = hash_str("a.md");
        assert_eq!(hash.len(), 64);
        assert!(hash.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_eq!(hash, hash_bytes(b"a.md"));
    }

    #[rstest]
    #[case("a.md", "a.md")]
    #[case("posts\\2024\\a.md", "posts/2024/a.md")]
    #[case("./posts/a.md", "posts/a.md")]
    #[case("././a.md", "a.md")]
    // "e" + combining acute accent becomes a single precomposed code point.
    #[case("cafe\u{301}.md", "caf\u{e9}.md")]
    fn test_normalize_path(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_path(input), expected);
    }

    #[test]
    fn test_post_id_from_path() {
        assert_eq!(post_id(None, "a.md"), hash_str("a.md"));
        assert_eq!(post_id(Some(""), "./a.md"), hash_str("a.md"));
        assert_eq!(post_id(Some("   "), "a.md"), hash_str("a.md"));
    }

    #[test]
    fn test_post_id_prefers_uuid() {
        let uuid = "6f1c2a9e-5b7d-4c1e-9a3f-0d8e7b6a5c4d";
        assert_eq!(post_id(Some(uuid), "a.md"), hash_str(uuid));
        assert_eq!(post_id(Some(uuid), "a.md"), post_id(Some(uuid), "moved/b.md"));
    }
}
