//! Store key layout.
//!
//! All keys written by keybox live under a configured prefix:
//!
//! | Purpose | Layout |
//! |---------|--------|
//! | cache entry | `{prefix}:cache:{key}` |
//! | tag index | `{prefix}:tag:{tag}` |
//! | rate-limit window | `{prefix}:ratelimit:{client}:{resource}` |
//!
//! Every layout has its own segment, so no cache key or pattern can reach a
//! tag index or a rate-limit window.
//!
//! Length validation applies to the full key, prefix included, and happens
//! before any store call.

use crate::error::StoreError;

const SEPARATOR: char = ':';
const CACHE_SEGMENT: &str = "cache";
const TAG_SEGMENT: &str = "tag";
const RATE_LIMIT_SEGMENT: &str = "ratelimit";

/// Default upper bound for a full key.
pub const DEFAULT_MAX_KEY_LENGTH: usize = 512;

/// Key prefix plus length policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
    max_key_length: usize,
}

impl Namespace {
    /// Namespace under `prefix` with the default length bound.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            max_key_length: DEFAULT_MAX_KEY_LENGTH,
        }
    }

    /// Overrides the upper bound of a full key.
    pub fn with_max_key_length(mut self, max_key_length: usize) -> Self {
        self.max_key_length = max_key_length;
        self
    }

    /// The configured prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Upper bound of a full key, prefix included.
    pub fn max_key_length(&self) -> usize {
        self.max_key_length
    }

    /// Full key for a cache entry.
    pub fn cache_key(&self, key: &str) -> Result<String, StoreError> {
        require_non_empty("key", key)?;
        self.checked(self.join(&[CACHE_SEGMENT, key]))
    }

    /// Glob pattern for cache keys under this namespace.
    pub fn cache_pattern(&self, pattern: &str) -> Result<String, StoreError> {
        require_non_empty("pattern", pattern)?;
        self.checked(self.join(&[CACHE_SEGMENT, pattern]))
    }

    /// Key of the set indexing all cache keys carrying `tag`.
    pub fn tag_key(&self, tag: &str) -> Result<String, StoreError> {
        require_non_empty("tag", tag)?;
        self.checked(self.join(&[TAG_SEGMENT, tag]))
    }

    /// Key of the sliding-window set for a (client, resource) pair.
    pub fn rate_limit_key(&self, client_id: &str, resource: &str) -> Result<String, StoreError> {
        require_non_empty("client id", client_id)?;
        require_non_empty("resource", resource)?;
        self.checked(self.join(&[RATE_LIMIT_SEGMENT, client_id, resource]))
    }

    /// Glob pattern matching every rate-limit window key.
    pub fn rate_limit_pattern(&self) -> String {
        self.join(&[RATE_LIMIT_SEGMENT, "*"])
    }

    fn join(&self, parts: &[&str]) -> String {
        let capacity = self.prefix.len() + parts.iter().map(|p| p.len() + 1).sum::<usize>();
        let mut key = String::with_capacity(capacity);
        key.push_str(&self.prefix);
        for part in parts {
            if !key.is_empty() {
                key.push(SEPARATOR);
            }
            key.push_str(part);
        }
        key
    }

    fn checked(&self, key: String) -> Result<String, StoreError> {
        if key.len() > self.max_key_length {
            return Err(StoreError::validation(format!(
                "key length {} exceeds maximum of {}",
                key.len(),
                self.max_key_length
            )));
        }
        Ok(key)
    }
}

fn require_non_empty(what: &str, value: &str) -> Result<(), StoreError> {
    if value.trim().is_empty() {
        return Err(StoreError::validation(format!("{what} must not be empty")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FaultKind;

    #[test]
    fn keys_are_prefixed() {
        let ns = Namespace::new("cms");
        assert_eq!(ns.cache_key("news:42").unwrap(), "cms:cache:news:42");
        assert_eq!(ns.tag_key("news").unwrap(), "cms:tag:news");
        assert_eq!(
            ns.rate_limit_key("10.0.0.1", "contact-form").unwrap(),
            "cms:ratelimit:10.0.0.1:contact-form"
        );
        assert_eq!(ns.rate_limit_pattern(), "cms:ratelimit:*");
    }

    #[test]
    fn empty_prefix_has_no_leading_separator() {
        let ns = Namespace::new("");
        assert_eq!(ns.cache_key("events").unwrap(), "cache:events");
    }

    #[test]
    fn length_includes_prefix() {
        let ns = Namespace::new("abc").with_max_key_length(14);
        assert!(ns.cache_key("1234").is_ok());

        let error = ns.cache_key("12345").unwrap_err();
        assert_eq!(error.kind(), FaultKind::Validation);
    }

    #[test]
    fn blank_arguments_fail_validation() {
        let ns = Namespace::new("cms");
        assert_eq!(ns.cache_key("  ").unwrap_err().kind(), FaultKind::Validation);
        assert_eq!(
            ns.rate_limit_key("", "x").unwrap_err().kind(),
            FaultKind::Validation
        );
    }

    #[test]
    fn cache_keys_cannot_reach_internal_keys() {
        let ns = Namespace::new("cms");
        assert_ne!(ns.cache_key("tag:news").unwrap(), ns.tag_key("news").unwrap());
        assert_ne!(
            ns.cache_key("ratelimit:a:b").unwrap(),
            ns.rate_limit_key("a", "b").unwrap()
        );
        assert_eq!(ns.cache_pattern("*").unwrap(), "cms:cache:*");
    }
}
