use crate::models::Record;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// A server-side rendered fragment (diagram, math, ...) keyed by the hash of
/// whatever produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SsrArtifact {
    /// Renderer kind, e.g. `d2` or `katex`; also the store sub-category
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "input_hash")]
    pub input_hash: String,
    /// Content store hash of the rendered output
    #[serde(rename = "output_hash")]
    pub output_hash: String,
    /// Number of posts referencing `input_hash`.
    ///
    /// Only recomputed by garbage collection, so treat it as a hint: it may
    /// be stale between collections. Nothing decides reachability from it.
    #[serde(rename = "ref_count", default)]
    pub ref_count: u32,
    /// Uncompressed output size in bytes
    #[serde(rename = "size", default)]
    pub size: u64,
    #[serde(rename = "created_at", with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(rename = "compressed", default)]
    pub compressed: bool,
}
impl Record for SsrArtifact {
    const KIND: &'static str = "ssr artifact";
}
impl SsrArtifact {
    /// Bucket key for an artifact.
    pub fn key(kind: &str, input_hash: &str) -> String {
        format!("{kind}:{input_hash}")
    }

    /// Content store category holding outputs of `kind`.
    pub fn category(kind: &str) -> String {
        format!("ssr/{kind}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_record_survives_encoding() {
        let artifact = SsrArtifact {
            kind: "d2".to_string(),
            input_hash: "abc".to_string(),
            output_hash: "def".to_string(),
            ref_count: 3,
            size: 2048,
            created_at: datetime!(2025-01-02 03:04:05 UTC),
            compressed: true,
        };
        assert_eq!(SsrArtifact::decode(&artifact.encode().unwrap()).unwrap(), artifact);
    }

    #[test]
    fn test_zero_values_survive_encoding() {
        let artifact = SsrArtifact {
            kind: String::new(),
            input_hash: String::new(),
            output_hash: String::new(),
            ref_count: 0,
            size: 0,
            created_at: OffsetDateTime::UNIX_EPOCH,
            compressed: false,
        };
        assert_eq!(SsrArtifact::decode(&artifact.encode().unwrap()).unwrap(), artifact);
    }

    #[test]
    fn test_keys() {
        assert_eq!(SsrArtifact::key("d2", "h1"), "d2:h1");
        assert_eq!(SsrArtifact::category("katex"), "ssr/katex");
    }
}
