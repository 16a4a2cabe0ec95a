//! In-memory cache store.
//!
//! Fingerprint-keyed entries in a [`DashMap`], with read-time
//! invalidation: an entry past its stale-while-revalidate window is
//! removed by the probe that finds it. The store also keeps the vary
//! index — which header names a URL's entries were fingerprinted under —
//! so that probes recompute the same key an insertion used.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use smol_str::SmolStr;

use courier_core::{CacheEntry, CacheKey, Freshness};

/// Result of a cache probe.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    /// Entry is fresh; serve it.
    Fresh(CacheEntry),
    /// Entry is inside its stale window; serve it and revalidate.
    Stale(CacheEntry),
    /// No servable entry.
    Miss,
}

/// Store counters and size.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Entries currently stored.
    pub entries: usize,
    /// Fresh probe hits since construction or reset.
    pub hits: u64,
    /// Probe misses (including read-time invalidations).
    pub misses: u64,
    /// Stale probe hits.
    pub stale_hits: u64,
}

/// Fingerprint-keyed in-memory cache.
#[derive(Debug, Default)]
pub struct CacheStore {
    entries: DashMap<CacheKey, CacheEntry>,
    vary: DashMap<CacheKey, Arc<Vec<SmolStr>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    stale_hits: AtomicU64,
}

impl CacheStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Probes for a servable entry, removing one past its window.
    pub fn get(&self, key: &CacheKey) -> CacheLookup {
        let now = Utc::now();
        let found = self.entries.get(key).map(|e| e.value().clone());
        match found {
            Some(entry) => match entry.freshness(now) {
                Freshness::Fresh => {
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    CacheLookup::Fresh(entry)
                }
                Freshness::Stale => {
                    self.stale_hits.fetch_add(1, Ordering::Relaxed);
                    CacheLookup::Stale(entry)
                }
                Freshness::Expired => {
                    self.entries.remove(key);
                    self.misses.fetch_add(1, Ordering::Relaxed);
                    CacheLookup::Miss
                }
            },
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                CacheLookup::Miss
            }
        }
    }

    /// Reads an entry without counters or invalidation. Used to derive
    /// conditional headers for refetches.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Writes an entry.
    pub fn insert(&self, key: CacheKey, entry: CacheEntry) {
        self.entries.insert(key, entry);
    }

    /// Records the vary names entries for `base` are fingerprinted under.
    pub fn set_vary(&self, base: CacheKey, names: Arc<Vec<SmolStr>>) {
        self.vary.insert(base, names);
    }

    /// Vary names previously recorded for `base`.
    pub fn vary_names(&self, base: &CacheKey) -> Option<Arc<Vec<SmolStr>>> {
        self.vary.get(base).map(|names| Arc::clone(names.value()))
    }

    /// Removes one entry. Returns whether it existed.
    pub fn invalidate(&self, key: &CacheKey) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Removes every entry and the vary index.
    pub fn clear(&self) {
        self.entries.clear();
        self.vary.clear();
    }

    /// Number of entries currently stored.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters and size.
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.entries.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
        }
    }
}
