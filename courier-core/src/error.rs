//! Error types for request orchestration.
//!
//! [`Error`] is the closed set of terminal outcomes a caller can observe
//! from the orchestrator. [`AdapterError`] is the narrower set a transport
//! adapter may raise for a single attempt; the orchestrator classifies it
//! into an [`Error`] using the cancellation state of the request.
//!
//! `Error` is `Clone` (causes are `Arc`-shared) because terminal errors
//! flow both to the caller and into event payloads.

use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use smol_str::SmolStr;
use thiserror::Error as ThisError;

use crate::response::Response;
use crate::signal::AbortOrigin;

/// Boxed error source used at the transport seam.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Shared error cause carried inside [`Error`].
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Terminal error for a logical request.
///
/// Every production site constructs exactly one variant; there is no
/// free-form string escape hatch.
#[derive(Debug, Clone, ThisError)]
pub enum Error {
    /// A cancellation signal (user, external, or request deadline) fired
    /// before a response was validated.
    #[error("request canceled ({origin}){}", reason.as_ref().map(|r| format!(": {r}")).unwrap_or_default())]
    Canceled {
        /// Which signal source fired first.
        origin: AbortOrigin,
        /// Caller-supplied cancellation reason, if any.
        reason: Option<SmolStr>,
    },

    /// The timeout signal fired before the attempt completed.
    #[error("request timed out after {elapsed:?}")]
    Timeout {
        /// Time spent before the timeout fired.
        elapsed: Duration,
    },

    /// The adapter failed without producing a status code (DNS, TCP, TLS).
    #[error("network error: {source}")]
    Network {
        /// Underlying transport failure.
        source: SharedError,
    },

    /// The adapter returned a response that failed status validation.
    #[error("HTTP status {status}")]
    Http {
        /// The offending status code.
        status: StatusCode,
        /// The full response, for callers that want the body or headers.
        response: Box<Response>,
    },

    /// The adapter could not open the transport at all.
    #[error("request could not be sent: {source}")]
    SendFailed {
        /// Underlying pre-flight failure.
        source: SharedError,
    },

    /// The request queue was closed before or while this request waited.
    #[error("request queue closed: {reason}")]
    QueueClosed {
        /// Reason given to `close` or `clear`.
        reason: SmolStr,
    },

    /// The caller's signal fired while the request waited for a permit.
    #[error("aborted while waiting for a queue permit")]
    AbortedWhileWaiting,

    /// Invalid configuration detected at construction or submission time.
    #[error("invalid configuration: {message}")]
    Config {
        /// Human-readable description of the rejected value.
        message: String,
    },
}

impl Error {
    /// A network error from a boxed transport cause.
    pub fn network(source: impl Into<BoxError>) -> Self {
        Error::Network {
            source: Arc::from(source.into()),
        }
    }

    /// A pre-flight send failure from a boxed transport cause.
    pub fn send_failed(source: impl Into<BoxError>) -> Self {
        Error::SendFailed {
            source: Arc::from(source.into()),
        }
    }

    /// Status code carried by this error, when one exists.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Http { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Whether this error is a cancellation (never retried, never passed
    /// through error interceptors).
    pub fn is_canceled(&self) -> bool {
        matches!(self, Error::Canceled { .. })
    }

    /// Whether this error is the timeout terminal outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Stable machine-readable code for this error kind.
    ///
    /// HTTP errors render as `HTTP_<status>`.
    pub fn code(&self) -> SmolStr {
        match self {
            Error::Canceled { .. } => SmolStr::new_static("CANCELED"),
            Error::Timeout { .. } => SmolStr::new_static("TIMEOUT"),
            Error::Network { .. } => SmolStr::new_static("NETWORK_ERROR"),
            Error::Http { status, .. } => SmolStr::new(format!("HTTP_{}", status.as_u16())),
            Error::SendFailed { .. } => SmolStr::new_static("REQUEST_SEND_FAILED"),
            Error::QueueClosed { .. } => SmolStr::new_static("QUEUE_CLOSED"),
            Error::AbortedWhileWaiting => SmolStr::new_static("ABORTED_WHILE_WAITING"),
            Error::Config { .. } => SmolStr::new_static("CONFIG"),
        }
    }
}

/// Error raised by a transport adapter for a single attempt.
///
/// Adapters must distinguish cancellation from network failure: an attempt
/// that stopped because the signal fired is `Aborted`, never `Network`.
#[derive(Debug, ThisError)]
pub enum AdapterError {
    /// The cancellation signal fired during the attempt.
    #[error("attempt aborted by signal")]
    Aborted,

    /// The transport could not be opened (pre-flight failure).
    #[error("transport could not be opened")]
    SendFailed {
        /// Underlying failure.
        #[source]
        source: BoxError,
    },

    /// The attempt failed below the HTTP layer (DNS, TCP, TLS, read).
    #[error("transport failure")]
    Network {
        /// Underlying failure.
        #[source]
        source: BoxError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn http_error_code_carries_status() {
        let response = Response::synthetic(StatusCode::SERVICE_UNAVAILABLE);
        let err = Error::Http {
            status: StatusCode::SERVICE_UNAVAILABLE,
            response: Box::new(response),
        };
        assert_eq!(err.code(), "HTTP_503");
        assert_eq!(err.status(), Some(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn canceled_is_never_a_timeout() {
        let err = Error::Canceled {
            origin: AbortOrigin::User,
            reason: Some(SmolStr::new_static("navigation")),
        };
        assert!(err.is_canceled());
        assert!(!err.is_timeout());
        assert_eq!(err.code(), "CANCELED");
    }

    #[test]
    fn errors_clone_for_event_payloads() {
        let err = Error::network("dns lookup failed");
        let cloned = err.clone();
        assert_eq!(cloned.code(), "NETWORK_ERROR");
        assert!(cloned.to_string().contains("dns lookup failed"));
    }
}
