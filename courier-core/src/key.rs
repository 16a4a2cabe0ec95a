//! Cache fingerprints.
//!
//! A [`CacheKey`] identifies one cacheable exchange: the deterministic
//! serialization of `{method, canonical URL, normalized params, selected
//! vary headers}`. Keys wrap their rendered form in an `Arc`, so cloning
//! is a reference-count bump; they are passed around on every probe,
//! insert, and background revalidation.
//!
//! Canonicalization rules:
//!
//! - URL query keys are sorted lexicographically; path and fragment are
//!   preserved; the authority is kept only when present.
//! - Params are normalized recursively: object keys sorted, `null`s
//!   dropped, arrays kept in order with their elements normalized.
//! - Vary selection defaults to `{accept, authorization}` and may be
//!   overridden per entry by a server `Vary` header at insertion.

use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use http::Method;
use serde_json::{Map, Value};
use smol_str::SmolStr;

/// Request headers included in a fingerprint when the server sent no
/// `Vary` header.
pub const DEFAULT_VARY_HEADERS: &[&str] = &["accept", "authorization"];

#[derive(Debug)]
struct KeyInner {
    rendered: String,
}

/// A canonical cache fingerprint.
#[derive(Debug, Clone)]
pub struct CacheKey {
    inner: Arc<KeyInner>,
}

impl CacheKey {
    /// A caller-chosen key, used verbatim.
    pub fn custom(key: impl Into<String>) -> Self {
        CacheKey {
            inner: Arc::new(KeyInner {
                rendered: key.into(),
            }),
        }
    }

    /// Fingerprints one exchange.
    ///
    /// `vary` carries the already-selected `(header, value)` pairs; absent
    /// request headers appear with an empty value so that "no header" and
    /// "header with empty value" collide deliberately.
    pub fn fingerprint(
        method: &Method,
        url: &str,
        params: Option<&Map<String, Value>>,
        vary: &[(SmolStr, SmolStr)],
    ) -> Self {
        let mut doc = Map::new();
        doc.insert("method".into(), Value::String(method.as_str().to_owned()));
        doc.insert("url".into(), Value::String(canonical_url(url)));
        if let Some(params) = params {
            if let Some(normalized) = normalize_params(&Value::Object(params.clone())) {
                doc.insert("params".into(), normalized);
            }
        }
        let mut vary_doc = Map::new();
        let mut sorted: Vec<&(SmolStr, SmolStr)> = vary.iter().collect();
        sorted.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in sorted {
            vary_doc.insert(name.to_string(), Value::String(value.to_string()));
        }
        doc.insert("vary".into(), Value::Object(vary_doc));

        // serde_json keeps insertion order, and every map above was built
        // in sorted order, so the rendering is deterministic.
        let rendered = Value::Object(doc).to_string();
        CacheKey {
            inner: Arc::new(KeyInner { rendered }),
        }
    }

    /// The rendered fingerprint.
    pub fn as_str(&self) -> &str {
        &self.inner.rendered
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.rendered)
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.rendered == other.inner.rendered
    }
}

impl Eq for CacheKey {}

impl Hash for CacheKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.rendered.hash(state);
    }
}

/// Sorts a URL's query pairs lexicographically, preserving path and
/// fragment. The authority is untouched when present and absent URLs
/// (plain paths) stay relative.
pub fn canonical_url(url: &str) -> String {
    let (without_fragment, fragment) = match url.split_once('#') {
        Some((head, frag)) => (head, Some(frag)),
        None => (url, None),
    };
    let (base, query) = match without_fragment.split_once('?') {
        Some((head, query)) => (head, Some(query)),
        None => (without_fragment, None),
    };

    let mut out = base.to_owned();
    if let Some(query) = query {
        let mut pairs: Vec<&str> = query.split('&').filter(|p| !p.is_empty()).collect();
        pairs.sort_unstable();
        if !pairs.is_empty() {
            out.push('?');
            out.push_str(&pairs.join("&"));
        }
    }
    if let Some(fragment) = fragment {
        out.push('#');
        out.push_str(fragment);
    }
    out
}

/// Normalizes a params tree: object keys sorted, `null`s dropped,
/// recursion into objects and arrays. Returns `None` for `null` so that
/// dropped members disappear rather than serialize.
pub fn normalize_params(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut out = Map::new();
            for key in keys {
                if let Some(normalized) = map.get(key).and_then(normalize_params) {
                    out.insert(key.clone(), normalized);
                }
            }
            Some(Value::Object(out))
        }
        Value::Array(items) => Some(Value::Array(
            items.iter().filter_map(normalize_params).collect(),
        )),
        other => Some(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_keys_are_sorted() {
        assert_eq!(
            canonical_url("https://api.test/items?b=2&a=1#frag"),
            "https://api.test/items?a=1&b=2#frag"
        );
        assert_eq!(canonical_url("/items?z=9&a=1"), "/items?a=1&z=9");
        assert_eq!(canonical_url("/items"), "/items");
    }

    #[test]
    fn params_normalize_recursively() {
        let params = json!({"z": 1, "a": {"d": null, "c": [1, null, 2]}, "n": null});
        let normalized = normalize_params(&params).unwrap();
        assert_eq!(
            serde_json::to_string(&normalized).unwrap(),
            r#"{"a":{"c":[1,2]},"z":1}"#
        );
    }

    #[test]
    fn equivalent_requests_share_a_fingerprint() {
        let vary = [(SmolStr::new_static("accept"), SmolStr::new_static("*/*"))];
        let a = CacheKey::fingerprint(&Method::GET, "/items?b=2&a=1", None, &vary);
        let b = CacheKey::fingerprint(&Method::GET, "/items?a=1&b=2", None, &vary);
        assert_eq!(a, b);

        let c = CacheKey::fingerprint(&Method::GET, "/items?a=1&b=3", None, &vary);
        assert_ne!(a, c);
    }

    #[test]
    fn vary_order_does_not_matter() {
        let ab = [
            (SmolStr::new_static("accept"), SmolStr::new_static("*/*")),
            (SmolStr::new_static("authorization"), SmolStr::new_static("")),
        ];
        let ba = [
            (SmolStr::new_static("authorization"), SmolStr::new_static("")),
            (SmolStr::new_static("accept"), SmolStr::new_static("*/*")),
        ];
        let a = CacheKey::fingerprint(&Method::GET, "/x", None, &ab);
        let b = CacheKey::fingerprint(&Method::GET, "/x", None, &ba);
        assert_eq!(a, b);
    }
}
