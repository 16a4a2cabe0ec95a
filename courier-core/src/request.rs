//! The logical request model.
//!
//! A [`Request`] is what the orchestrator dispatches: defaults already
//! merged, URL already resolved against the base, headers lowercased by
//! construction ([`http::HeaderName`] keys are always lowercase). It is
//! mutated only by request interceptors before dispatch and treated as
//! immutable once the `request:start` event is emitted; per-attempt state
//! (`retry_count`, conditional headers) is re-derived on a clone.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;

use crate::key::CacheKey;
use crate::signal::AbortSignal;

/// Dense identifier assigned by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Per-request status validation override.
pub type StatusValidator = Arc<dyn Fn(StatusCode) -> bool + Send + Sync>;

/// Per-request cache behavior overrides.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// TTL override for entries written by this request.
    pub ttl: Option<Duration>,
    /// Skip the cache probe entirely (still writes on success).
    pub ignore_cache: bool,
    /// Bypass the probe and refetch, attaching conditional headers when an
    /// entry exists.
    pub force_refresh: bool,
    /// Whether a stale hit kicks off a background revalidation.
    /// Unset means yes.
    pub revalidate_on_stale: Option<bool>,
}

/// Per-request retry overrides; unset fields fall back to the client
/// configuration.
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    /// Maximum retry attempts after the initial one.
    pub max_retries: Option<u32>,
    /// Base delay for exponential backoff.
    pub delay: Option<Duration>,
    /// Jitter factor in `[0, 1]`.
    pub jitter: Option<f64>,
}

/// Creation-time metadata stamped by the orchestrator.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    /// When the logical request was created.
    pub created_at: DateTime<Utc>,
    /// Set on the distinct background request a stale hit spawns.
    pub is_revalidation: bool,
    /// Free-form caller metadata.
    pub custom: Option<Value>,
}

impl Default for RequestMeta {
    fn default() -> Self {
        RequestMeta {
            created_at: Utc::now(),
            is_revalidation: false,
            custom: None,
        }
    }
}

/// A normalized logical request.
#[derive(Clone)]
pub struct Request {
    /// Stable identifier, assigned at preparation.
    pub id: RequestId,
    /// HTTP method.
    pub method: Method,
    /// Fully resolved URL (base joined, query appended).
    pub url: String,
    /// Headers with lowercase keys.
    pub headers: HeaderMap,
    /// Structured query parameters, normalized into the URL and the cache
    /// fingerprint.
    pub params: Option<serde_json::Map<String, Value>>,
    /// Raw request body.
    pub body: Option<Bytes>,
    /// Attempt timeout; `None` disables the timer.
    pub timeout: Option<Duration>,
    /// Retry overrides.
    pub retry: RetryOptions,
    /// Cache behavior overrides.
    pub cache: CacheOptions,
    /// Explicit fingerprint; filled by the cache policy when absent.
    pub cache_key: Option<CacheKey>,
    /// Caller-supplied cancellation signal.
    pub signal: Option<AbortSignal>,
    /// Per-request status validation; falls back to the client default.
    pub validate_status: Option<StatusValidator>,
    /// Creation metadata.
    pub meta: RequestMeta,
    /// Number of retries already performed for this logical request.
    pub retry_count: u32,
}

impl Request {
    /// A minimal request for the given method and resolved URL.
    pub fn new(id: RequestId, method: Method, url: impl Into<String>) -> Self {
        Request {
            id,
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            params: None,
            body: None,
            timeout: None,
            retry: RetryOptions::default(),
            cache: CacheOptions::default(),
            cache_key: None,
            signal: None,
            validate_status: None,
            meta: RequestMeta::default(),
            retry_count: 0,
        }
    }

    /// Whether the cache probe applies to this request.
    pub fn is_cache_probe_eligible(&self) -> bool {
        self.method == Method::GET && !self.cache.ignore_cache && !self.cache.force_refresh
    }

    /// Whether this request refetches an existing entry (conditional
    /// headers apply when one exists).
    pub fn is_refetch(&self) -> bool {
        self.cache.force_refresh || self.meta.is_revalidation
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("method", &self.method)
            .field("url", &self.url)
            .field("headers", &self.headers)
            .field("timeout", &self.timeout)
            .field("retry_count", &self.retry_count)
            .field("is_revalidation", &self.meta.is_revalidation)
            .finish_non_exhaustive()
    }
}
