//! HTTP caching policy.
//!
//! Decides cacheability from method, status, and `Cache-Control`
//! semantics; derives TTLs and stale-while-revalidate windows; selects
//! vary headers for the fingerprint; and attaches conditional headers for
//! revalidating refetches.

use std::time::Duration;

use chrono::{DateTime, Utc};
use http::header::{AUTHORIZATION, CACHE_CONTROL, DATE, EXPIRES, HeaderMap, HeaderName, IF_MODIFIED_SINCE, IF_NONE_MATCH, VARY};
use http::{HeaderValue, Method, StatusCode};
use smol_str::SmolStr;

use courier_core::{CacheEntry, CacheKey, Request, Response, DEFAULT_VARY_HEADERS};

/// Parsed `Cache-Control` directives relevant to the policy.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheControl {
    /// `no-store` present.
    pub no_store: bool,
    /// `no-cache` present.
    pub no_cache: bool,
    /// `public` present.
    pub public: bool,
    /// `max-age` in seconds.
    pub max_age: Option<u64>,
    /// `s-maxage` in seconds.
    pub s_maxage: Option<u64>,
    /// `stale-while-revalidate` in seconds.
    pub stale_while_revalidate: Option<u64>,
}

impl CacheControl {
    /// Parses every `Cache-Control` header value in `headers`.
    pub fn parse(headers: &HeaderMap) -> Self {
        let mut out = CacheControl::default();
        for value in headers.get_all(CACHE_CONTROL) {
            let Ok(value) = value.to_str() else { continue };
            for directive in value.split(',') {
                let directive = directive.trim();
                let (name, arg) = match directive.split_once('=') {
                    Some((name, arg)) => (name.trim(), Some(arg.trim().trim_matches('"'))),
                    None => (directive, None),
                };
                match name.to_ascii_lowercase().as_str() {
                    "no-store" => out.no_store = true,
                    "no-cache" => out.no_cache = true,
                    "public" => out.public = true,
                    "max-age" => out.max_age = arg.and_then(|a| a.parse().ok()),
                    "s-maxage" => out.s_maxage = arg.and_then(|a| a.parse().ok()),
                    "stale-while-revalidate" => {
                        out.stale_while_revalidate = arg.and_then(|a| a.parse().ok())
                    }
                    _ => {}
                }
            }
        }
        out
    }

    fn explicitly_cacheable(&self) -> bool {
        self.public || self.max_age.is_some() || self.s_maxage.is_some()
    }
}

/// The orchestrator's caching policy.
#[derive(Debug, Clone)]
pub struct HttpCachePolicy {
    default_ttl: Duration,
}

impl HttpCachePolicy {
    /// Policy with the given fallback TTL for responses carrying no
    /// freshness information.
    pub fn new(default_ttl: Duration) -> Self {
        HttpCachePolicy { default_ttl }
    }

    /// Vary header names declared by a response, lowercased.
    ///
    /// Returns `None` when the response declares no `Vary` header (the
    /// default selection applies) and an empty list is never returned:
    /// `Vary: *` is handled by [`should_cache`](Self::should_cache).
    pub fn response_vary(headers: &HeaderMap) -> Option<Vec<SmolStr>> {
        let mut names: Vec<SmolStr> = Vec::new();
        for value in headers.get_all(VARY) {
            let Ok(value) = value.to_str() else { continue };
            for name in value.split(',') {
                let name = name.trim().to_ascii_lowercase();
                if !name.is_empty() && name != "*" {
                    names.push(SmolStr::new(name));
                }
            }
        }
        names.sort();
        names.dedup();
        if names.is_empty() { None } else { Some(names) }
    }

    /// Default vary selection.
    pub fn default_vary() -> Vec<SmolStr> {
        DEFAULT_VARY_HEADERS.iter().map(|n| SmolStr::new_static(n)).collect()
    }

    /// Selects `(name, value)` pairs for the given vary names from a
    /// request's headers; absent headers select an empty value.
    pub fn select_vary(headers: &HeaderMap, names: &[SmolStr]) -> Vec<(SmolStr, SmolStr)> {
        names
            .iter()
            .map(|name| {
                let value = headers
                    .get(name.as_str())
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("");
                (name.clone(), SmolStr::new(value))
            })
            .collect()
    }

    /// Fingerprints a request under the given vary names.
    pub fn fingerprint(request: &Request, vary_names: &[SmolStr]) -> CacheKey {
        let vary = Self::select_vary(&request.headers, vary_names);
        CacheKey::fingerprint(&request.method, &request.url, request.params.as_ref(), &vary)
    }

    /// Whether a validated exchange should be written to the cache.
    ///
    /// GET + 2xx, neither side opted out via `Cache-Control`, and
    /// authorized requests only when the response is explicitly cacheable.
    /// `max-age=0` disables caching unless a stale-while-revalidate window
    /// keeps the entry servable.
    pub fn should_cache(&self, request: &Request, response: &Response) -> bool {
        if request.method != Method::GET || !response.status.is_success() {
            return false;
        }
        let request_cc = CacheControl::parse(&request.headers);
        if request_cc.no_store || request_cc.no_cache {
            return false;
        }
        let response_cc = CacheControl::parse(&response.headers);
        if response_cc.no_store {
            return false;
        }
        if response.headers.get_all(VARY).iter().any(|v| v.to_str().is_ok_and(|v| v.split(',').any(|n| n.trim() == "*"))) {
            return false;
        }
        if request.headers.contains_key(AUTHORIZATION) && !response_cc.explicitly_cacheable() {
            return false;
        }
        if response_cc.max_age == Some(0) && response_cc.stale_while_revalidate.is_none() {
            return false;
        }
        true
    }

    /// Freshness lifetime of a response: `max-age`, else `Expires − Date`
    /// clamped to zero, else the configured default (or the per-request
    /// override when one was given).
    pub fn ttl(&self, request: &Request, response_headers: &HeaderMap) -> Duration {
        let cc = CacheControl::parse(response_headers);
        if let Some(seconds) = cc.max_age.or(cc.s_maxage) {
            return Duration::from_secs(seconds);
        }
        if let Some(expires) = http_date(response_headers, &EXPIRES) {
            let reference = http_date(response_headers, &DATE).unwrap_or_else(Utc::now);
            let delta = (expires - reference).num_seconds().max(0);
            return Duration::from_secs(delta as u64);
        }
        request.cache.ttl.unwrap_or(self.default_ttl)
    }

    /// Stale-while-revalidate window declared by the response.
    pub fn stale_window(&self, response_headers: &HeaderMap) -> Option<Duration> {
        CacheControl::parse(response_headers)
            .stale_while_revalidate
            .map(Duration::from_secs)
    }

    /// Builds the immutable entry for a validated response.
    pub fn build_entry(&self, request: &Request, response: &Response, now: DateTime<Utc>) -> CacheEntry {
        let ttl = self.ttl(request, &response.headers);
        CacheEntry {
            body: response.body.clone(),
            status: response.status,
            headers: response.headers.clone(),
            etag: response.etag.clone(),
            last_modified: response.last_modified.clone(),
            expires: expiry(now, ttl),
            stale_while_revalidate: self.stale_window(&response.headers),
            timestamp: now,
        }
    }

    /// Conditional headers a revalidating refetch should carry for an
    /// existing entry.
    pub fn conditional_headers(entry: &CacheEntry) -> Vec<(HeaderName, HeaderValue)> {
        let mut out = Vec::new();
        if let Some(etag) = entry.etag.as_deref() {
            if let Ok(value) = HeaderValue::from_str(etag) {
                out.push((IF_NONE_MATCH, value));
            }
        }
        if let Some(modified) = entry.last_modified.as_deref() {
            if let Ok(value) = HeaderValue::from_str(modified) {
                out.push((IF_MODIFIED_SINCE, value));
            }
        }
        out
    }

    /// Materializes a `304 Not Modified` into a refreshed entry: cached
    /// body, headers merged with the revalidation response, new write
    /// timestamp and expiry.
    pub fn refresh_entry(
        &self,
        request: &Request,
        stale: &CacheEntry,
        not_modified_headers: &HeaderMap,
        now: DateTime<Utc>,
    ) -> CacheEntry {
        let mut headers = stale.headers.clone();
        for (name, value) in not_modified_headers {
            headers.insert(name.clone(), value.clone());
        }
        let ttl = self.ttl(request, &headers);
        CacheEntry {
            body: stale.body.clone(),
            status: StatusCode::OK,
            etag: header_string(&headers, http::header::ETAG).or_else(|| stale.etag.clone()),
            last_modified: header_string(&headers, http::header::LAST_MODIFIED)
                .or_else(|| stale.last_modified.clone()),
            expires: expiry(now, ttl),
            stale_while_revalidate: self.stale_window(&headers).or(stale.stale_while_revalidate),
            timestamp: now,
            headers,
        }
    }
}

fn expiry(now: DateTime<Utc>, ttl: std::time::Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn http_date(headers: &HeaderMap, name: &HeaderName) -> Option<DateTime<Utc>> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| DateTime::parse_from_rfc2822(v).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn header_string(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
}
