use crate::models::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Pre-tokenized search data for one post, produced by the indexer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchRecord {
    #[serde(rename = "title")]
    pub title: String,
    #[serde(rename = "norm_title")]
    pub normalized_title: String,
    #[serde(rename = "tokens")]
    pub tokens: Vec<String>,
    /// Term → frequency, for BM25 scoring
    #[serde(rename = "bm25_data")]
    pub term_frequencies: BTreeMap<String, u32>,
    #[serde(rename = "doc_len")]
    pub doc_len: u32,
    #[serde(rename = "content")]
    pub content: String,
    #[serde(rename = "norm_tags")]
    pub normalized_tags: Vec<String>,
    #[serde(rename = "words")]
    pub words: Vec<String>,
}
impl Record for SearchRecord {
    const KIND: &'static str = "search record";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_survives_encoding() {
        let record = SearchRecord {
            title: "Hello, World".to_string(),
            normalized_title: "hello world".to_string(),
            tokens: vec!["hello".to_string(), "world".to_string()],
            term_frequencies: BTreeMap::from([("hello".to_string(), 2), ("world".to_string(), 1)]),
            doc_len: 3,
            content: "hello hello world".to_string(),
            normalized_tags: vec!["intro".to_string()],
            words: vec!["hello".to_string(), "hello".to_string(), "world".to_string()],
        };
        assert_eq!(SearchRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }

    #[test]
    fn test_empty_record_survives_encoding() {
        let record = SearchRecord::default();
        assert_eq!(SearchRecord::decode(&record.encode().unwrap()).unwrap(), record);
    }
}
