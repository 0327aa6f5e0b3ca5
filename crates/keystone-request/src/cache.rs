//! # Request Cache
//!
//! Completed documents keyed by `RequestKey`.
//!
//! Each entry ages through three phases under a `CachePolicy`:
//! - **fresh**: served as is
//! - **soft-expired**: served, and refreshed in the background
//! - **expired**: refetched (also the case once an entry is marked stale)

use crate::document::Document;
use crate::request::{Request, RequestKey};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tokio::time::Instant;

/// Something that may be stored in the request cache.
pub trait Cacheable {
    /// Key under which the result is cached, or `None` if it must not be.
    fn cache_key(&self) -> Option<RequestKey>;
}

impl Cacheable for Request {
    fn cache_key(&self) -> Option<RequestKey> {
        self.is_cacheable().then(|| self.key())
    }
}

/// Expiry settings, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachePolicy {
    /// Age after which a document is refreshed in the background.
    #[serde(default = "default_soft_ttl_ms")]
    pub soft_ttl_ms: u64,
    /// Age after which a document is refetched before being served.
    #[serde(default = "default_hard_ttl_ms")]
    pub hard_ttl_ms: u64,
}

fn default_soft_ttl_ms() -> u64 {
    30_000
}

fn default_hard_ttl_ms() -> u64 {
    300_000
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            soft_ttl_ms: default_soft_ttl_ms(),
            hard_ttl_ms: default_hard_ttl_ms(),
        }
    }
}

impl CachePolicy {
    fn freshness(&self, age: Duration, stale: bool) -> Freshness {
        if stale || age >= Duration::from_millis(self.hard_ttl_ms) {
            Freshness::Expired
        } else if age >= Duration::from_millis(self.soft_ttl_ms) {
            Freshness::SoftExpired
        } else {
            Freshness::Fresh
        }
    }
}

/// Age classification of a cached document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    SoftExpired,
    Expired,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    document: Document,
    stored_at: Instant,
    stale: bool,
    /// Resource types present in the document, for invalidation.
    types: BTreeSet<String>,
}

/// Document cache for one pipeline.
#[derive(Debug, Clone, Default)]
pub struct RequestCache {
    entries: BTreeMap<RequestKey, CacheEntry>,
    policy: CachePolicy,
}

impl RequestCache {
    #[must_use]
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            entries: BTreeMap::new(),
            policy,
        }
    }

    #[must_use]
    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    /// Look up a document and classify its age.
    #[must_use]
    pub fn lookup(&self, key: &RequestKey, now: Instant) -> Option<(Document, Freshness)> {
        let entry = self.entries.get(key)?;
        let age = now.saturating_duration_since(entry.stored_at);
        Some((entry.document.clone(), self.policy.freshness(age, entry.stale)))
    }

    /// Store a document, replacing any previous entry.
    pub fn insert(
        &mut self,
        key: RequestKey,
        document: Document,
        types: BTreeSet<String>,
        now: Instant,
    ) {
        self.entries.insert(
            key,
            CacheEntry {
                document,
                stored_at: now,
                stale: false,
                types,
            },
        );
    }

    /// Mark one entry stale. Returns `false` if it was not cached.
    pub fn invalidate(&mut self, key: &RequestKey) -> bool {
        match self.entries.get_mut(key) {
            Some(entry) => {
                entry.stale = true;
                true
            }
            None => false,
        }
    }

    /// Mark stale every entry containing one of `types`. Returns the keys
    /// that turned stale.
    pub fn invalidate_types(&mut self, types: &BTreeSet<String>) -> Vec<RequestKey> {
        let mut invalidated = Vec::new();
        for (key, entry) in &mut self.entries {
            if !entry.stale && !entry.types.is_disjoint(types) {
                entry.stale = true;
                invalidated.push(key.clone());
            }
        }
        invalidated
    }

    pub fn remove(&mut self, key: &RequestKey) -> Option<Document> {
        self.entries.remove(key).map(|entry| entry.document)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::ResponseMeta;
    use crate::request::Method;

    fn document(request: &Request) -> Document {
        Document::empty(request.clone(), ResponseMeta::default())
    }

    fn types(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn only_cacheable_requests_have_keys() {
        assert!(Request::get("/posts").cache_key().is_some());
        assert!(Request::new(Method::Post, "/posts").cache_key().is_none());
    }

    #[test]
    fn ages_through_policy_phases() {
        let policy = CachePolicy {
            soft_ttl_ms: 100,
            hard_ttl_ms: 1000,
        };
        let mut cache = RequestCache::new(policy);
        let request = Request::get("/posts");
        let key = request.key();
        let start = Instant::now();
        cache.insert(key.clone(), document(&request), types(&["post"]), start);

        let at = |ms| start + Duration::from_millis(ms);
        assert_eq!(cache.lookup(&key, at(10)).map(|(_, f)| f), Some(Freshness::Fresh));
        assert_eq!(
            cache.lookup(&key, at(500)).map(|(_, f)| f),
            Some(Freshness::SoftExpired)
        );
        assert_eq!(
            cache.lookup(&key, at(1000)).map(|(_, f)| f),
            Some(Freshness::Expired)
        );
    }

    #[test]
    fn invalidation_by_type() {
        let mut cache = RequestCache::default();
        let posts = Request::get("/posts");
        let users = Request::get("/users");
        let now = Instant::now();
        cache.insert(posts.key(), document(&posts), types(&["post", "user"]), now);
        cache.insert(users.key(), document(&users), types(&["user"]), now);

        let hit = cache.invalidate_types(&types(&["post"]));
        assert_eq!(hit, vec![posts.key()]);
        assert_eq!(
            cache.lookup(&posts.key(), now).map(|(_, f)| f),
            Some(Freshness::Expired)
        );
        assert_eq!(
            cache.lookup(&users.key(), now).map(|(_, f)| f),
            Some(Freshness::Fresh)
        );
        // Already stale entries are not reported twice.
        assert!(cache.invalidate_types(&types(&["post"])).is_empty());
    }
}
