use crate::models::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Where a post's rendered HTML lives.
///
/// Small pages are kept inside the record itself; anything larger goes to the
/// content store under the `html` category and only its hash is kept here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HtmlRef {
    #[serde(rename = "inline")]
    Inline(String),
    #[serde(rename = "blob")]
    Blob(String),
}

/// A heading in a post's table of contents.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TocEntry {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "text")]
    pub text: String,
    #[serde(rename = "level")]
    pub level: u8,
}

/// Everything the build knows about one source post.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PostMeta {
    #[serde(rename = "post_id")]
    pub post_id: String,
    /// Normalized source path
    #[serde(rename = "path")]
    pub path: String,
    /// Source modification time, Unix nanoseconds
    #[serde(rename = "mod_time")]
    pub mod_time: i64,
    #[serde(rename = "content_hash")]
    pub content_hash: String,
    #[serde(rename = "html", skip_serializing_if = "Option::is_none")]
    pub html: Option<HtmlRef>,
    #[serde(rename = "template_hash")]
    pub template_hash: String,
    #[serde(rename = "ssr_input_hashes", skip_serializing_if = "Vec::is_empty")]
    pub ssr_input_hashes: Vec<String>,
    #[serde(rename = "title")]
    pub title: String,
    #[serde(rename = "date", with = "time::serde::rfc3339::option", skip_serializing_if = "Option::is_none")]
    pub date: Option<OffsetDateTime>,
    #[serde(rename = "tags", skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    #[serde(rename = "word_count")]
    pub word_count: u32,
    /// Minutes
    #[serde(rename = "reading_time")]
    pub reading_time: u32,
    #[serde(rename = "description", skip_serializing_if = "String::is_empty")]
    pub description: String,
    #[serde(rename = "link")]
    pub link: String,
    #[serde(rename = "weight")]
    pub weight: i32,
    #[serde(rename = "pinned")]
    pub pinned: bool,
    #[serde(rename = "draft")]
    pub draft: bool,
    /// Front matter the cache doesn't interpret
    #[serde(rename = "meta", skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(rename = "toc", skip_serializing_if = "Vec::is_empty")]
    pub toc: Vec<TocEntry>,
    #[serde(rename = "version", skip_serializing_if = "String::is_empty")]
    pub version: String,
}
impl Record for PostMeta {
    const KIND: &'static str = "post";
}
impl PostMeta {
    /// Hash of the externally stored HTML, if the HTML isn't inlined.
    pub fn html_hash(&self) -> Option<&str> {
        match &self.html {
            Some(HtmlRef::Blob(hash)) => Some(hash),
            _ => None,
        }
    }

    pub fn inline_html(&self) -> Option<&str> {
        match &self.html {
            Some(HtmlRef::Inline(html)) => Some(html),
            _ => None,
        }
    }
}

/// The slice of a post needed to render version listings.
#[derive(Debug, Clone, PartialEq)]
pub struct PostListMeta {
    pub title: String,
    pub link: String,
    pub weight: i32,
    pub version: String,
    pub date: Option<OffsetDateTime>,
}
impl From<&PostMeta> for PostListMeta {
    fn from(post: &PostMeta) -> Self {
        Self {
            title: post.title.clone(),
            link: post.link.clone(),
            weight: post.weight,
            version: post.version.clone(),
            date: post.date,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn full_post() -> PostMeta {
        PostMeta {
            post_id: "4f2a".to_string(),
            path: "posts/hello.md".to_string(),
            mod_time: 1_700_000_000_123_456_789,
            content_hash: "c0ffee".to_string(),
            html: Some(HtmlRef::Blob("beef".to_string())),
            template_hash: "7e3a".to_string(),
            ssr_input_hashes: vec!["d2:1".to_string(), "katex:2".to_string()],
            title: "Hello".to_string(),
            date: Some(datetime!(2024-03-01 12:30:00 +01:00)),
            tags: vec!["go".to_string(), "ssg".to_string()],
            word_count: 812,
            reading_time: 4,
            description: "First post".to_string(),
            link: "/posts/hello/".to_string(),
            weight: -3,
            pinned: true,
            draft: false,
            meta: BTreeMap::from([("series".to_string(), serde_json::json!({"part": 1}))]),
            toc: vec![TocEntry { id: "intro".to_string(), text: "Intro".to_string(), level: 2 }],
            version: "v2".to_string(),
        }
    }

    #[test]
    fn test_full_record_survives_encoding() {
        let post = full_post();
        assert_eq!(PostMeta::decode(&post.encode().unwrap()).unwrap(), post);
    }

    #[test]
    fn test_empty_record_survives_encoding() {
        let post = PostMeta::default();
        let bytes = post.encode().unwrap();
        assert_eq!(PostMeta::decode(&bytes).unwrap(), post);
    }

    #[test]
    fn test_empty_fields_are_omitted() {
        let bytes = PostMeta::default().encode().unwrap();
        let text = String::from_utf8(bytes).unwrap();
        assert!(!text.contains("\"html\""));
        assert!(!text.contains("\"tags\""));
        assert!(!text.contains("\"date\""));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let post = PostMeta::decode(br#"{"post_id":"x","path":"a.md","future_field":[1,2]}"#).unwrap();
        assert_eq!(post.post_id, "x");
        assert_eq!(post.path, "a.md");
    }

    #[test]
    fn test_html_accessors() {
        let mut post = full_post();
        assert_eq!(post.html_hash(), Some("beef"));
        assert_eq!(post.inline_html(), None);
        post.html = Some(HtmlRef::Inline("<p>hi</p>".to_string()));
        assert_eq!(post.html_hash(), None);
        assert_eq!(post.inline_html(), Some("<p>hi</p>"));
    }

    #[test]
    fn test_list_meta_from_post() {
        let post = full_post();
        let meta = PostListMeta::from(&post);
        assert_eq!(meta.title, "Hello");
        assert_eq!(meta.version, "v2");
        assert_eq!(meta.date, post.date);
    }
}
