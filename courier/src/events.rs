//! Lifecycle event taxonomy.
//!
//! Event names form a colon-separated domain (`request:start`,
//! `cache:hit`) so pattern subscriptions like `request:*` work naturally.
//! Payloads are one closed sum over the data each lifecycle point
//! carries.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{CacheKey, Error, Request, Response};

use crate::metrics::MetricsSnapshot;

/// Event-name constants emitted by the client.
pub mod names {
    /// First attempt is about to execute.
    pub const REQUEST_START: &str = "request:start";
    /// Terminal: the logical request finished (success or error).
    pub const REQUEST_END: &str = "request:end";
    /// Terminal: the request was canceled.
    pub const REQUEST_CANCELED: &str = "request:canceled";
    /// A response validated successfully.
    pub const RESPONSE_SUCCESS: &str = "response:success";
    /// A terminal error (other than cancellation) occurred.
    pub const RESPONSE_ERROR: &str = "response:error";
    /// The timeout signal fired.
    pub const TIMEOUT: &str = "timeout";
    /// A retry was scheduled.
    pub const RETRY_ATTEMPT: &str = "retry:attempt";
    /// Retries were exhausted without success.
    pub const RETRY_FAILED: &str = "retry:failed";
    /// Fresh cache hit served.
    pub const CACHE_HIT: &str = "cache:hit";
    /// Cache probe missed.
    pub const CACHE_MISS: &str = "cache:miss";
    /// Stale cache hit served.
    pub const CACHE_STALE: &str = "cache:stale";
    /// An entry was written.
    pub const CACHE_SET: &str = "cache:set";
    /// An entry was invalidated by key.
    pub const CACHE_INVALIDATED: &str = "cache:invalidated";
    /// The cache was cleared.
    pub const CACHE_CLEAR: &str = "cache:clear";
    /// Periodic metrics snapshot.
    pub const METRICS_COLLECT: &str = "metrics:collect";
    /// A transport-level failure occurred.
    pub const CONNECTION_ERROR: &str = "connection:error";
}

/// Payload carried by every client emission.
#[derive(Debug, Clone)]
pub enum EventPayload {
    /// Request-only lifecycle points (`request:start`, `request:end` on
    /// error, `request:canceled`, `timeout`).
    Request {
        /// The originating request.
        request: Arc<Request>,
    },
    /// Response-carrying points (`response:success`, `request:end` on
    /// success, `cache:hit`, `cache:stale`).
    Response {
        /// The originating request.
        request: Arc<Request>,
        /// The response delivered.
        response: Arc<Response>,
    },
    /// Error-carrying points (`response:error`, `connection:error`,
    /// `retry:failed`).
    Error {
        /// The originating request.
        request: Arc<Request>,
        /// The terminal error.
        error: Arc<Error>,
    },
    /// A scheduled retry (`retry:attempt`).
    Retry {
        /// The originating request.
        request: Arc<Request>,
        /// 1-based attempt number.
        attempt: u32,
        /// The backoff delay before the attempt.
        delay: Duration,
    },
    /// Cache maintenance (`cache:miss`, `cache:set`, `cache:invalidated`).
    Cache {
        /// The affected fingerprint.
        key: CacheKey,
        /// The request that touched the entry, when one exists.
        request: Option<Arc<Request>>,
    },
    /// The cache was cleared (`cache:clear`).
    CacheCleared,
    /// Periodic snapshot (`metrics:collect`).
    Metrics {
        /// The snapshot taken at the interval tick.
        snapshot: MetricsSnapshot,
    },
}

impl EventPayload {
    /// The request carried by this payload, when one exists.
    pub fn request(&self) -> Option<&Arc<Request>> {
        match self {
            EventPayload::Request { request }
            | EventPayload::Response { request, .. }
            | EventPayload::Error { request, .. }
            | EventPayload::Retry { request, .. } => Some(request),
            EventPayload::Cache { request, .. } => request.as_ref(),
            EventPayload::CacheCleared | EventPayload::Metrics { .. } => None,
        }
    }
}
