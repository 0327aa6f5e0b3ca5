//! # Request Descriptors
//!
//! A `Request` describes one operation declaratively. Its `RequestKey` is a
//! blake3 digest over length-prefixed fields:
//!
//! ```text
//! METHOD canonical-url op canonical-body
//! ```
//!
//! The canonical URL merges the URL query with `params`, decodes every pair
//! and re-encodes them in sorted order. JSON object keys in the body are
//! sorted. Structurally identical requests therefore share a key, and
//! differently encoded values never do. An explicit `cache_options.key`
//! replaces the canonical form.

use keystone_core::KeystoneError;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Origin relative URLs are resolved against when computing keys. The
/// `.invalid` TLD never names a real host.
const RELATIVE_BASE: &str = "http://keystone.invalid/";

// =============================================================================
// METHOD
// =============================================================================

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum Method {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Patch => "PATCH",
            Self::Delete => "DELETE",
        }
    }

    /// Whether the method changes server state.
    #[must_use]
    pub fn is_mutation(self) -> bool {
        self != Self::Get
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = KeystoneError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Self::Get),
            "POST" => Ok(Self::Post),
            "PUT" => Ok(Self::Put),
            "PATCH" => Ok(Self::Patch),
            "DELETE" => Ok(Self::Delete),
            other => Err(KeystoneError::Config(format!("unknown method '{other}'"))),
        }
    }
}

// =============================================================================
// REQUEST
// =============================================================================

/// The single resource a request loads. The pipeline moves that record
/// through `loading` and into `loaded` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordTarget {
    #[serde(rename = "type")]
    pub resource_type: String,
    pub id: String,
}

/// Per-request cache behavior.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheOptions {
    /// Bypass the request cache and refetch.
    #[serde(default)]
    pub reload: bool,
    /// Serve a cached document and refresh it in the background.
    #[serde(default)]
    pub background_reload: bool,
    /// Explicit cache key. Also makes a non-GET request cacheable.
    #[serde(default)]
    pub key: Option<String>,
}

/// One declarative operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub url: String,
    #[serde(default)]
    pub method: Method,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub body: Option<Value>,
    /// Operation name, e.g. `findRecord` or `createRecord`.
    #[serde(default)]
    pub op: Option<String>,
    #[serde(default)]
    pub cache_options: CacheOptions,
    #[serde(default)]
    pub target: Option<RecordTarget>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::Get, url)
    }

    /// `findRecord` for one resource.
    #[must_use]
    pub fn find_record(
        url: impl Into<String>,
        resource_type: impl Into<String>,
        id: impl Into<String>,
    ) -> Self {
        Self::get(url).op("findRecord").target(resource_type, id)
    }

    #[must_use]
    pub fn target(mut self, resource_type: impl Into<String>, id: impl Into<String>) -> Self {
        self.target = Some(RecordTarget {
            resource_type: resource_type.into(),
            id: id.into(),
        });
        self
    }

    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name: String = name.into();
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    #[must_use]
    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    #[must_use]
    pub fn op(mut self, op: impl Into<String>) -> Self {
        self.op = Some(op.into());
        self
    }

    #[must_use]
    pub fn reload(mut self) -> Self {
        self.cache_options.reload = true;
        self
    }

    #[must_use]
    pub fn background_reload(mut self) -> Self {
        self.cache_options.background_reload = true;
        self
    }

    #[must_use]
    pub fn with_cache_key(mut self, key: impl Into<String>) -> Self {
        self.cache_options.key = Some(key.into());
        self
    }

    /// Only GET requests and requests with an explicit key are cached and
    /// coalesced.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        self.method == Method::Get || self.cache_options.key.is_some()
    }

    /// The URL parsed and resolved against a placeholder origin, or `None`
    /// if it cannot be parsed.
    fn parsed_url(&self) -> Option<Url> {
        Url::parse(RELATIVE_BASE).ok()?.join(&self.url).ok()
    }

    /// URL query pairs merged with `params`, decoded and sorted.
    #[must_use]
    pub fn query_pairs(&self) -> BTreeSet<(String, String)> {
        let mut pairs: BTreeSet<(String, String)> = self
            .parsed_url()
            .map(|url| url.query_pairs().into_owned().collect())
            .unwrap_or_default();
        pairs.extend(self.params.iter().map(|(k, v)| (k.clone(), v.clone())));
        pairs
    }

    /// URL with the fragment dropped and the merged query re-encoded in
    /// sorted order.
    #[must_use]
    pub fn canonical_url(&self) -> String {
        let Some(mut url) = self.parsed_url() else {
            return self.url.clone();
        };
        let pairs = self.query_pairs();
        url.set_fragment(None);
        url.set_query(None);
        if !pairs.is_empty() {
            url.query_pairs_mut().extend_pairs(&pairs);
        }
        url.to_string()
    }

    /// Deterministic identity of this request.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        if let Some(explicit) = &self.cache_options.key {
            return RequestKey::digest(&["key", explicit]);
        }
        let mut body = String::new();
        if let Some(value) = &self.body {
            canonical_json(value, &mut body);
        }
        let (target_type, target_id) = self
            .target
            .as_ref()
            .map(|t| (t.resource_type.as_str(), t.id.as_str()))
            .unwrap_or_default();
        RequestKey::digest(&[
            "request",
            self.method.as_str(),
            &self.canonical_url(),
            self.op.as_deref().unwrap_or_default(),
            &body,
            target_type,
            target_id,
        ])
    }
}

/// Serialize JSON with object keys sorted.
fn canonical_json(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<&String, &Value> = map.iter().collect();
            out.push('{');
            for (i, (key, item)) in sorted.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                canonical_json(item, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                canonical_json(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

// =============================================================================
// REQUEST KEY
// =============================================================================

/// Hex blake3 digest identifying a request in the cache and in-flight table.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey(String);

impl RequestKey {
    /// Hash length-prefixed fields so no two field lists share a digest.
    fn digest(fields: &[&str]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for field in fields {
            hasher.update(&(field.len() as u64).to_le_bytes());
            hasher.update(field.as_bytes());
        }
        Self(hasher.finalize().to_hex().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn param_order_does_not_matter() {
        let a = Request::get("/posts?include=author").param("page", "2");
        let b = Request::get("/posts?page=2").param("include", "author");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn body_key_order_does_not_matter() {
        let a = Request::new(Method::Post, "/posts").body(json!({"a": 1, "b": {"x": 1, "y": 2}}));
        let b = Request::new(Method::Post, "/posts").body(json!({"b": {"y": 2, "x": 1}, "a": 1}));
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn method_and_op_change_the_key() {
        let get = Request::get("/posts");
        let post = Request::new(Method::Post, "/posts");
        let named = Request::get("/posts").op("query");
        assert_ne!(get.key(), post.key());
        assert_ne!(get.key(), named.key());
    }

    #[test]
    fn explicit_key_overrides_and_enables_caching() {
        let a = Request::new(Method::Post, "/search").with_cache_key("search:rust");
        let b = Request::new(Method::Post, "/other").with_cache_key("search:rust");
        assert!(a.is_cacheable());
        assert_eq!(a.key(), b.key());
        assert!(!Request::new(Method::Post, "/search").is_cacheable());
    }

    #[test]
    fn headers_are_case_insensitive_and_not_keyed() {
        let request = Request::get("/posts").header("Accept", "application/json");
        assert_eq!(
            request.headers.get("accept").map(String::as_str),
            Some("application/json")
        );
        assert_eq!(request.key(), Request::get("/posts").key());
    }

    #[test]
    fn method_parses_case_insensitively() {
        assert_eq!("patch".parse::<Method>().expect("parse"), Method::Patch);
        assert!("TRACE".parse::<Method>().is_err());
        assert!(Method::Delete.is_mutation());
        assert!(!Method::Get.is_mutation());
    }

    #[test]
    fn reserved_characters_in_values_do_not_collide() {
        let packed = Request::get("/posts").param("a", "1&b=2");
        let split = Request::get("/posts").param("a", "1").param("b", "2");
        assert_ne!(packed.key(), split.key());

        let encoded = Request::get("/posts?a=1%26b%3D2");
        assert_eq!(encoded.key(), packed.key());
        assert_eq!(
            encoded.canonical_url(),
            "http://keystone.invalid/posts?a=1%26b%3D2"
        );
    }

    #[test]
    fn fields_do_not_run_together() {
        let a = Request::get("/posts").op("find all");
        let b = Request::get("/posts").op("find").body(json!("all"));
        assert_ne!(a.key(), b.key());
        assert_ne!(
            Request::get("/posts").with_cache_key("GET").key(),
            Request::get("/posts").key()
        );
    }

    #[test]
    fn fragment_is_ignored() {
        assert_eq!(
            Request::get("/posts#top").key(),
            Request::get("/posts").key()
        );
    }

    #[test]
    fn find_record_names_its_target() {
        let request = Request::find_record("/posts/1", "post", "1");
        assert_eq!(request.op.as_deref(), Some("findRecord"));
        assert!(request.is_cacheable());
        assert_ne!(request.key(), Request::get("/posts/1").op("findRecord").key());

        let parsed: Request = serde_json::from_value(json!({
            "url": "/posts/1",
            "target": {"type": "post", "id": "1"}
        }))
        .expect("request");
        assert_eq!(
            parsed.target,
            Some(RecordTarget {
                resource_type: "post".into(),
                id: "1".into()
            })
        );
    }

    #[test]
    fn key_is_hex_digest() {
        let key = Request::get("/posts").key();
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
