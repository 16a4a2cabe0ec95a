//! Cache entry value type and freshness states.
//!
//! A [`CacheEntry`] is immutable after write. Freshness is computed from
//! absolute timestamps: fresh until `expires`, stale-but-usable inside the
//! stale-while-revalidate window, invalid past it (and removed on read).

use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http::{HeaderMap, StatusCode};

/// Freshness of a cached entry at an observation instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Before `expires`; servable as-is.
    Fresh,
    /// Inside the stale-while-revalidate window; servable while a
    /// background refresh runs.
    Stale,
    /// Past `expires + swr`; must be removed.
    Expired,
}

/// One cached exchange.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Response body.
    pub body: Bytes,
    /// Response status at write time.
    pub status: StatusCode,
    /// Response headers at write time.
    pub headers: HeaderMap,
    /// `ETag` validator, if the response carried one.
    pub etag: Option<String>,
    /// `Last-Modified` validator, if the response carried one.
    pub last_modified: Option<String>,
    /// Absolute expiry.
    pub expires: DateTime<Utc>,
    /// Stale-while-revalidate window past `expires`.
    pub stale_while_revalidate: Option<Duration>,
    /// Write time; refreshed in place by a `304` revalidation.
    pub timestamp: DateTime<Utc>,
}

impl CacheEntry {
    /// Freshness at `now`.
    pub fn freshness(&self, now: DateTime<Utc>) -> Freshness {
        if now < self.expires {
            return Freshness::Fresh;
        }
        match self.stale_while_revalidate.map(|w| self.stale_limit(w)) {
            // An unrepresentable limit means the window never closes.
            Some(None) => Freshness::Stale,
            Some(Some(limit)) if now < limit => Freshness::Stale,
            _ => Freshness::Expired,
        }
    }

    fn stale_limit(&self, window: Duration) -> Option<DateTime<Utc>> {
        chrono::Duration::from_std(window)
            .ok()
            .and_then(|delta| self.expires.checked_add_signed(delta))
    }

    /// Whether the entry must be dropped at `now`.
    pub fn is_invalid(&self, now: DateTime<Utc>) -> bool {
        self.freshness(now) == Freshness::Expired
    }

    /// Approximate heap footprint, for the cache size gauge.
    pub fn weight(&self) -> usize {
        self.body.len()
            + self
                .headers
                .iter()
                .map(|(name, value)| name.as_str().len() + value.len())
                .sum::<usize>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(expires: DateTime<Utc>, swr: Option<Duration>) -> CacheEntry {
        CacheEntry {
            body: Bytes::from_static(b"cached"),
            status: StatusCode::OK,
            headers: HeaderMap::new(),
            etag: None,
            last_modified: None,
            expires,
            stale_while_revalidate: swr,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn freshness_tracks_the_swr_window() {
        let now = Utc::now();
        let e = entry(now + chrono::Duration::seconds(10), Some(Duration::from_secs(60)));
        assert_eq!(e.freshness(now), Freshness::Fresh);
        assert_eq!(
            e.freshness(now + chrono::Duration::seconds(30)),
            Freshness::Stale
        );
        assert_eq!(
            e.freshness(now + chrono::Duration::seconds(120)),
            Freshness::Expired
        );
    }

    #[test]
    fn no_swr_means_expiry_is_terminal() {
        let now = Utc::now();
        let e = entry(now - chrono::Duration::seconds(1), None);
        assert_eq!(e.freshness(now), Freshness::Expired);
        assert!(e.is_invalid(now));
    }
}
