//! Field tag grammar: `key[=value]` attributes separated by `;`.
//!
//! A bare key parses as `true`, matching the declaration shorthand for
//! flags such as `required` and `cascade`.

use std::collections::BTreeMap;

#[derive(Debug, Clone, Default)]
pub(crate) struct TagSet {
    attributes: BTreeMap<String, String>,
}

impl TagSet {
    pub(crate) fn parse(raw: &str) -> Self {
        let mut attributes = BTreeMap::new();
        for part in raw.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            match part.split_once('=') {
                Some((key, value)) => {
                    attributes.insert(key.trim().to_string(), value.trim().to_string());
                }
                None => {
                    attributes.insert(part.to_string(), "true".to_string());
                }
            }
        }
        Self { attributes }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub(crate) fn has(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    /// True for both the bare form (`required`) and `required=true`.
    pub(crate) fn is_true(&self, key: &str) -> bool {
        self.get(key) == Some("true")
    }

    /// Value of a pool-binding tag, with `key` alone meaning the default
    /// pool.
    pub(crate) fn pool(&self, key: &str) -> Option<String> {
        self.get(key).map(|value| {
            if value == "true" || value.is_empty() {
                "default".to_string()
            } else {
                value.to_string()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_values_and_flags() {
        let tags = TagSet::parse("length=40;index=Name:2,Other;required");
        assert_eq!(tags.get("length"), Some("40"));
        assert_eq!(tags.get("index"), Some("Name:2,Other"));
        assert!(tags.is_true("required"));
        assert!(!tags.has("unique"));
    }

    #[test]
    fn pool_defaults() {
        let tags = TagSet::parse("localCache;redisCache=hot");
        assert_eq!(tags.pool("localCache").as_deref(), Some("default"));
        assert_eq!(tags.pool("redisCache").as_deref(), Some("hot"));
        assert_eq!(tags.pool("log"), None);
    }

    #[test]
    fn empty_and_whitespace() {
        let tags = TagSet::parse(" ; length = 12 ;");
        assert_eq!(tags.get("length"), Some("12"));
    }
}
