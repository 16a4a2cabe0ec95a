//! Client configuration.
//!
//! Knobs recognized by the orchestrator, validated at build time. The
//! adapter itself is supplied through the client builder's typestate, not
//! stored here.

use std::sync::Arc;
use std::time::Duration;

use http::HeaderMap;

use courier_core::{Error, Request, StatusValidator};

use crate::retry::RetryPolicy;

/// Custom retry decision hook; wins over the default classification.
pub type ShouldRetry = Arc<dyn Fn(&Request, &courier_core::Error) -> bool + Send + Sync>;

/// Orchestrator configuration.
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL request paths are resolved against.
    pub base_url: Option<String>,
    /// Headers merged into every request (per-request headers win).
    pub default_headers: HeaderMap,
    /// Queue capacity; must be positive.
    pub concurrent_requests: usize,
    /// Default attempt timeout.
    pub timeout: Option<Duration>,
    /// Default retry policy.
    pub retry: RetryPolicy,
    /// Whether the cache layer participates at all.
    pub enable_cache: bool,
    /// Fallback TTL for responses without freshness headers.
    pub default_cache_ttl: Duration,
    /// Attach `If-None-Match`/`If-Modified-Since` on refetches.
    pub enable_conditional_requests: bool,
    /// Emit `metrics:collect` on a 30-second interval.
    pub enable_metrics: bool,
    /// Status validation; default accepts 2xx.
    pub validate_status: Option<StatusValidator>,
    /// Custom retry decision; wins over the default classification.
    pub should_retry: Option<ShouldRetry>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            base_url: None,
            default_headers: HeaderMap::new(),
            concurrent_requests: 10,
            timeout: Some(Duration::from_secs(30)),
            retry: RetryPolicy::default(),
            enable_cache: true,
            default_cache_ttl: Duration::from_secs(300),
            enable_conditional_requests: false,
            enable_metrics: false,
            validate_status: None,
            should_retry: None,
        }
    }
}

impl ClientConfig {
    /// Validates the configuration at build time.
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrent_requests == 0 {
            return Err(Error::Config {
                message: "concurrent_requests must be positive".into(),
            });
        }
        if self.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config {
                message: "timeout must be positive when set".into(),
            });
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(Error::Config {
                message: format!(
                    "retry jitter must be within [0, 1], got {}",
                    self.retry.jitter
                ),
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("concurrent_requests", &self.concurrent_requests)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("enable_cache", &self.enable_cache)
            .field("default_cache_ttl", &self.default_cache_ttl)
            .field(
                "enable_conditional_requests",
                &self.enable_conditional_requests,
            )
            .field("enable_metrics", &self.enable_metrics)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(ClientConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_capacity_is_rejected() {
        let config = ClientConfig {
            concurrent_requests: 0,
            ..ClientConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn out_of_range_jitter_is_rejected() {
        let mut config = ClientConfig::default();
        config.retry.jitter = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }
}
