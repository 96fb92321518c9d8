use crate::models::Record;
use serde::{Deserialize, Serialize};

/// What a post was built from. Source of truth for the dependency indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Dependencies {
    #[serde(rename = "templates")]
    pub templates: Vec<String>,
    #[serde(rename = "includes")]
    pub includes: Vec<String>,
    #[serde(rename = "tags")]
    pub tags: Vec<String>,
}
impl Record for Dependencies {
    const KIND: &'static str = "dependencies";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_survives_encoding() {
        let deps = Dependencies {
            templates: vec!["layout.html".to_string(), "post.html".to_string()],
            includes: vec!["partials/nav.html".to_string()],
            tags: vec!["rust".to_string()],
        };
        assert_eq!(Dependencies::decode(&deps.encode().unwrap()).unwrap(), deps);
        let empty = Dependencies::default();
        assert_eq!(Dependencies::decode(&empty.encode().unwrap()).unwrap(), empty);
    }
}
