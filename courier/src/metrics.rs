//! Metrics collection for request observability.
//!
//! [`MetricsCollector`] keeps atomics-backed counters updated at
//! lifecycle points and produces [`MetricsSnapshot`]s on demand. Counters
//! are monotonic between [`reset`](MetricsCollector::reset) calls; gauges
//! clamp at zero.
//!
//! With the `metrics` feature enabled, lifecycle counters are mirrored to
//! the `metrics` facade under `courier_*` names.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use serde::Serialize;

use crate::queue::QueueStats;

#[cfg(feature = "metrics")]
use lazy_static::lazy_static;

#[cfg(feature = "metrics")]
lazy_static! {
    /// Track number of requests submitted.
    pub static ref REQUESTS_TOTAL: &'static str = {
        metrics::describe_counter!(
            "courier_requests_total",
            "Total number of requests submitted to the orchestrator."
        );
        "courier_requests_total"
    };
    /// Track number of requests finished successfully.
    pub static ref REQUESTS_SUCCESS: &'static str = {
        metrics::describe_counter!(
            "courier_requests_success_total",
            "Total number of requests that completed successfully."
        );
        "courier_requests_success_total"
    };
    /// Track number of requests finished in error.
    pub static ref REQUESTS_ERROR: &'static str = {
        metrics::describe_counter!(
            "courier_requests_error_total",
            "Total number of requests that terminated in error."
        );
        "courier_requests_error_total"
    };
    /// Track number of requests that timed out.
    pub static ref REQUESTS_TIMEOUT: &'static str = {
        metrics::describe_counter!(
            "courier_requests_timeout_total",
            "Total number of requests that hit their deadline."
        );
        "courier_requests_timeout_total"
    };
    /// Track number of retry attempts.
    pub static ref RETRY_ATTEMPTS: &'static str = {
        metrics::describe_counter!(
            "courier_retry_attempts_total",
            "Total number of retry attempts scheduled."
        );
        "courier_retry_attempts_total"
    };
    /// Gauge of requests currently executing.
    pub static ref REQUESTS_ACTIVE: &'static str = {
        metrics::describe_gauge!(
            "courier_requests_active",
            "Number of requests currently in flight."
        );
        "courier_requests_active"
    };
    /// Track cache hit events.
    pub static ref CACHE_HITS: &'static str = {
        metrics::describe_counter!(
            "courier_cache_hit_total",
            "Total number of fresh cache hits."
        );
        "courier_cache_hit_total"
    };
    /// Track cache miss events.
    pub static ref CACHE_MISSES: &'static str = {
        metrics::describe_counter!(
            "courier_cache_miss_total",
            "Total number of cache misses."
        );
        "courier_cache_miss_total"
    };
    /// Track stale cache hits.
    pub static ref CACHE_STALE: &'static str = {
        metrics::describe_counter!(
            "courier_cache_stale_total",
            "Total number of stale cache hits served."
        );
        "courier_cache_stale_total"
    };
}

/// Request lifecycle counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestMetrics {
    /// Requests submitted.
    pub total: u64,
    /// Requests currently executing.
    pub active: u64,
    /// Requests completed successfully.
    pub success: u64,
    /// Requests terminated in error (includes timeouts).
    pub error: u64,
    /// Requests that hit their deadline.
    pub timeout: u64,
    /// Retry attempts scheduled.
    pub retry: u64,
}

/// Cache counters at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheMetrics {
    /// Fresh hits.
    pub hit: u64,
    /// Misses.
    pub miss: u64,
    /// Stale hits.
    pub stale: u64,
    /// Entries currently stored.
    pub size: u64,
}

/// Queue gauges at snapshot time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueMetrics {
    /// Permits held plus waiters.
    pub length: u64,
    /// Permits held.
    pub active: u64,
    /// Waiters enqueued.
    pub pending: u64,
}

/// Point-in-time metrics snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Request lifecycle counters.
    pub requests: RequestMetrics,
    /// Cache counters.
    pub cache: CacheMetrics,
    /// Queue gauges.
    pub queue: QueueMetrics,
}

/// Atomics-backed lifecycle counters.
#[derive(Debug, Default)]
pub struct MetricsCollector {
    total: AtomicU64,
    active: AtomicI64,
    success: AtomicU64,
    error: AtomicU64,
    timeout: AtomicU64,
    retry: AtomicU64,
    cache_hit: AtomicU64,
    cache_miss: AtomicU64,
    cache_stale: AtomicU64,
}

impl MetricsCollector {
    /// A zeroed collector.
    pub fn new() -> Self {
        Self::default()
    }

    /// A request was submitted.
    pub fn request_submitted(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*REQUESTS_TOTAL).increment(1);
    }

    /// A request began executing.
    pub fn request_started(&self) {
        self.active.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::gauge!(*REQUESTS_ACTIVE).increment(1.0);
    }

    /// A started request reached a terminal state.
    pub fn request_finished(&self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::gauge!(*REQUESTS_ACTIVE).decrement(1.0);
    }

    /// A request completed successfully.
    pub fn record_success(&self) {
        self.success.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*REQUESTS_SUCCESS).increment(1);
    }

    /// A request terminated in error.
    pub fn record_error(&self) {
        self.error.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*REQUESTS_ERROR).increment(1);
    }

    /// A request hit its deadline.
    pub fn record_timeout(&self) {
        self.timeout.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*REQUESTS_TIMEOUT).increment(1);
    }

    /// A retry attempt was scheduled.
    pub fn record_retry(&self) {
        self.retry.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*RETRY_ATTEMPTS).increment(1);
    }

    /// A fresh cache hit was served.
    pub fn record_cache_hit(&self) {
        self.cache_hit.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*CACHE_HITS).increment(1);
    }

    /// A probe missed.
    pub fn record_cache_miss(&self) {
        self.cache_miss.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*CACHE_MISSES).increment(1);
    }

    /// A stale entry was served.
    pub fn record_cache_stale(&self) {
        self.cache_stale.fetch_add(1, Ordering::Relaxed);
        #[cfg(feature = "metrics")]
        metrics::counter!(*CACHE_STALE).increment(1);
    }

    /// Builds a snapshot. Cache size and queue gauges come from their
    /// owning components.
    pub fn snapshot(&self, cache_size: usize, queue: &QueueStats) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: RequestMetrics {
                total: self.total.load(Ordering::Relaxed),
                active: self.active.load(Ordering::Relaxed).max(0) as u64,
                success: self.success.load(Ordering::Relaxed),
                error: self.error.load(Ordering::Relaxed),
                timeout: self.timeout.load(Ordering::Relaxed),
                retry: self.retry.load(Ordering::Relaxed),
            },
            cache: CacheMetrics {
                hit: self.cache_hit.load(Ordering::Relaxed),
                miss: self.cache_miss.load(Ordering::Relaxed),
                stale: self.cache_stale.load(Ordering::Relaxed),
                size: cache_size as u64,
            },
            queue: QueueMetrics {
                length: (queue.active + queue.pending) as u64,
                active: queue.active as u64,
                pending: queue.pending as u64,
            },
        }
    }

    /// Zeroes every counter.
    pub fn reset(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.active.store(0, Ordering::Relaxed);
        self.success.store(0, Ordering::Relaxed);
        self.error.store(0, Ordering::Relaxed);
        self.timeout.store(0, Ordering::Relaxed);
        self.retry.store(0, Ordering::Relaxed);
        self.cache_hit.store(0, Ordering::Relaxed);
        self.cache_miss.store(0, Ordering::Relaxed);
        self.cache_stale.store(0, Ordering::Relaxed);
    }
}
