//! The response model.
//!
//! [`Response`] is what callers receive: the adapter's raw attempt result
//! plus orchestrator-added fields (duration, cache provenance, validator
//! extraction of `ETag`/`Last-Modified`).

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::header::{ETAG, LAST_MODIFIED};
use http::{HeaderMap, StatusCode};

use crate::request::RequestId;

/// A validated response for a logical request.
#[derive(Debug, Clone)]
pub struct Response {
    /// Originating request.
    pub request_id: RequestId,
    /// HTTP status.
    pub status: StatusCode,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Bytes,
    /// Wall time from dispatch to validation; zero for cache hits.
    pub duration: Duration,
    /// Whether the body was served from the cache.
    pub from_cache: bool,
    /// Write time of the entry that served this response.
    pub cache_timestamp: Option<DateTime<Utc>>,
    /// `ETag` header value, extracted for conditional requests.
    pub etag: Option<String>,
    /// `Last-Modified` header value, extracted for conditional requests.
    pub last_modified: Option<String>,
    /// Retries performed before this response was obtained.
    pub retry_count: u32,
}

impl Response {
    /// Builds a response from attempt output, extracting validator fields
    /// from the headers.
    pub fn from_attempt(
        request_id: RequestId,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        duration: Duration,
    ) -> Self {
        let etag = header_str(&headers, ETAG);
        let last_modified = header_str(&headers, LAST_MODIFIED);
        Response {
            request_id,
            status,
            headers,
            body,
            duration,
            from_cache: false,
            cache_timestamp: None,
            etag,
            last_modified,
            retry_count: 0,
        }
    }

    /// Deserializes the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }

    /// The body as UTF-8 text, lossily converted.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    /// An empty response with the given status. Test seam.
    pub fn synthetic(status: StatusCode) -> Self {
        Response {
            request_id: RequestId(0),
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            duration: Duration::ZERO,
            from_cache: false,
            cache_timestamp: None,
            etag: None,
            last_modified: None,
            retry_count: 0,
        }
    }
}

fn header_str(headers: &HeaderMap, name: http::header::HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::to_owned)
}
