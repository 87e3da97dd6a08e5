// mongoquery-core/src/cache.rs
// Result cache collaborator and the in-memory implementation

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Cache policy attached to a read.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheDirective {
    /// Explicit key; derived from the compiled query when absent.
    pub key: Option<String>,
    pub ttl: Option<Duration>,
    pub tag: Option<String>,
}

impl CacheDirective {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Stable digest key: `prefix:` + hex sha256 of the value's JSON text.
pub fn digest_key(prefix: &str, value: &Value) -> String {
    let digest = Sha256::digest(value.to_string().as_bytes());
    format!("{}:{}", prefix, hex::encode(digest))
}

/// Cache collaborator. Implementations must be safe to share between threads.
pub trait Cache: Send + Sync {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&self, key: &str, value: Value, tag: Option<&str>, ttl: Option<Duration>);

    fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    fn delete(&self, key: &str);

    /// Drop every key stored under `tag`.
    fn clear_tag(&self, tag: &str);

    /// Add `step` to a numeric entry (missing counts as 0) and return the new value.
    fn inc(&self, key: &str, step: i64) -> i64;
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// Process-local cache on `DashMap`.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: DashMap<String, Entry>,
    tags: DashMap<String, HashSet<String>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Cache for MemoryCache {
    fn get(&self, key: &str) -> Option<Value> {
        let now = Utc::now();
        let expired = match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            self.entries.remove(key);
        }
        None
    }

    fn set(&self, key: &str, value: Value, tag: Option<&str>, ttl: Option<Duration>) {
        let expires_at = ttl
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .map(|d| Utc::now() + d);
        self.entries
            .insert(key.to_string(), Entry { value, expires_at });
        if let Some(tag) = tag {
            self.tags
                .entry(tag.to_string())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn delete(&self, key: &str) {
        self.entries.remove(key);
    }

    fn clear_tag(&self, tag: &str) {
        if let Some((_, keys)) = self.tags.remove(tag) {
            for key in keys {
                self.entries.remove(&key);
            }
        }
    }

    fn inc(&self, key: &str, step: i64) -> i64 {
        let now = Utc::now();
        let mut entry = self.entries.entry(key.to_string()).or_insert(Entry {
            value: Value::from(0),
            expires_at: None,
        });
        let current = if entry.is_live(now) {
            entry.value.as_i64().unwrap_or(0)
        } else {
            0
        };
        let next = current + step;
        entry.value = Value::from(next);
        entry.expires_at = None;
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_set_get_delete() {
        let cache = MemoryCache::new();
        assert!(cache.get("k").is_none());
        cache.set("k", json!([1, 2]), None, None);
        assert_eq!(cache.get("k"), Some(json!([1, 2])));
        assert!(cache.has("k"));
        cache.delete("k");
        assert!(!cache.has("k"));
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new();
        cache.set("k", json!(1), None, Some(Duration::from_secs(0)));
        assert!(cache.get("k").is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_clear_tag() {
        let cache = MemoryCache::new();
        cache.set("a", json!(1), Some("users"), None);
        cache.set("b", json!(2), Some("users"), None);
        cache.set("c", json!(3), Some("orders"), None);
        cache.clear_tag("users");
        assert!(!cache.has("a"));
        assert!(!cache.has("b"));
        assert!(cache.has("c"));
        cache.clear_tag("missing");
    }

    #[test]
    fn test_inc() {
        let cache = MemoryCache::new();
        assert_eq!(cache.inc("n", 3), 3);
        assert_eq!(cache.inc("n", 4), 7);
        assert_eq!(cache.inc("n", -10), -3);
    }

    #[test]
    fn test_digest_key_is_stable() {
        let a = digest_key("q", &json!({"a": 1}));
        let b = digest_key("q", &json!({"a": 1}));
        let c = digest_key("q", &json!({"a": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("q:"));
        assert_eq!(a.len(), 2 + 64);
    }
}
