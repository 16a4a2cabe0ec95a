//! Background task offloading for stale-while-revalidate.
//!
//! Stale cache hits are served immediately while a fresh copy is fetched
//! on a spawned task. The manager deduplicates per cache key — one
//! revalidation in flight per entry — and supports cancelling everything
//! on shutdown.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info_span};

use courier_core::CacheKey;

#[derive(Debug, Default)]
struct Inner {
    tasks: DashMap<CacheKey, JoinHandle<()>>,
}

/// Manager for keyed background tasks.
#[derive(Debug, Clone, Default)]
pub struct OffloadManager {
    inner: Arc<Inner>,
}

impl OffloadManager {
    /// An empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawns `task` keyed by `key` unless one is already in flight.
    ///
    /// Returns `true` if the task was spawned, `false` if deduplicated.
    pub fn spawn_keyed<F>(&self, key: CacheKey, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self
            .inner
            .tasks
            .get(&key)
            .is_some_and(|handle| !handle.is_finished())
        {
            debug!(%key, "revalidation already in flight; skipping");
            return false;
        }

        let span = info_span!("offload_task", %key);
        let inner = Arc::clone(&self.inner);
        let cleanup_key = key.clone();
        let handle = tokio::spawn(
            async move {
                task.await;
                inner.tasks.remove(&cleanup_key);
            }
            .instrument(span),
        );
        self.inner.tasks.insert(key, handle);
        true
    }

    /// Whether a task for `key` is currently running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.inner
            .tasks
            .get(key)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Number of unfinished tasks.
    pub fn active_count(&self) -> usize {
        self.inner
            .tasks
            .iter()
            .filter(|entry| !entry.is_finished())
            .count()
    }

    /// Aborts every tracked task.
    pub fn cancel_all(&self) {
        for entry in self.inner.tasks.iter() {
            entry.abort();
        }
        self.inner.tasks.clear();
    }

    /// Waits until every tracked task has finished.
    pub async fn wait_all(&self) {
        loop {
            self.inner.tasks.retain(|_, handle| !handle.is_finished());
            if self.inner.tasks.is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
    }
}
