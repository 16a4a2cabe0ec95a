//! Pending-request bookkeeping.
//!
//! One [`PendingRecord`] per in-flight logical request, from registration
//! to terminal outcome. The record owns the internal abort controller and
//! the lifecycle latches; every event derived from those latches is
//! emitted by the request's own task, which is what keeps per-request
//! event order total.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tokio::task::JoinHandle;

use courier_core::{AbortController, AbortSignal, Request, RequestId};

/// Per-request lifecycle state.
#[derive(Debug)]
pub(crate) struct PendingRecord {
    /// Internal controller; user cancel, external flow-through, and the
    /// deadline all abort it, first origin wins.
    pub controller: AbortController,
    /// Caller-supplied signal, if any.
    pub external: Option<AbortSignal>,
    request: Mutex<Arc<Request>>,
    start_emitted: AtomicBool,
    canceled_emitted: AtomicBool,
    timeout_emitted: AtomicBool,
    deadline: Mutex<Option<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn latch(flag: &AtomicBool) -> bool {
    flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
}

impl PendingRecord {
    fn new(request: Arc<Request>) -> Self {
        PendingRecord {
            controller: AbortController::new(),
            external: request.signal.clone(),
            request: Mutex::new(request),
            start_emitted: AtomicBool::new(false),
            canceled_emitted: AtomicBool::new(false),
            timeout_emitted: AtomicBool::new(false),
            deadline: Mutex::new(None),
        }
    }

    /// Snapshot of the request for event payloads.
    pub fn request(&self) -> Arc<Request> {
        Arc::clone(&lock(&self.request))
    }

    /// Replaces the snapshot once interceptors have run.
    pub fn set_request(&self, request: Arc<Request>) {
        *lock(&self.request) = request;
    }

    /// Latches `start` emission. True exactly once.
    pub fn latch_start(&self) -> bool {
        latch(&self.start_emitted)
    }

    /// Whether `start` was emitted.
    pub fn start_emitted(&self) -> bool {
        self.start_emitted.load(Ordering::Acquire)
    }

    /// Latches `canceled` emission. True exactly once.
    pub fn latch_canceled(&self) -> bool {
        latch(&self.canceled_emitted)
    }

    /// Latches `timeout` emission. True exactly once.
    pub fn latch_timeout(&self) -> bool {
        latch(&self.timeout_emitted)
    }

    /// Stores the armed deadline timer.
    pub fn set_deadline(&self, handle: JoinHandle<()>) {
        *lock(&self.deadline) = Some(handle);
    }

    /// Disarms the deadline timer, if armed.
    pub fn abort_deadline(&self) {
        if let Some(handle) = lock(&self.deadline).take() {
            handle.abort();
        }
    }
}

/// Registry of in-flight requests.
#[derive(Debug, Default)]
pub(crate) struct PendingTable {
    records: DashMap<RequestId, Arc<PendingRecord>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a record for `request`. Exactly one per live id.
    pub fn register(&self, request: Arc<Request>) -> Arc<PendingRecord> {
        let record = Arc::new(PendingRecord::new(request.clone()));
        self.records.insert(request.id, Arc::clone(&record));
        record
    }

    pub fn get(&self, id: RequestId) -> Option<Arc<PendingRecord>> {
        self.records.get(&id).map(|r| Arc::clone(r.value()))
    }

    /// Removes the record on terminal outcome.
    pub fn remove(&self, id: RequestId) -> Option<Arc<PendingRecord>> {
        self.records.remove(&id).map(|(_, record)| record)
    }

    /// Ids of every in-flight request.
    pub fn ids(&self) -> Vec<RequestId> {
        self.records.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Method;

    fn request(id: u64) -> Arc<Request> {
        Arc::new(Request::new(RequestId(id), Method::GET, "/x"))
    }

    #[test]
    fn latches_fire_exactly_once() {
        let table = PendingTable::new();
        let record = table.register(request(1));
        assert!(record.latch_start());
        assert!(!record.latch_start());
        assert!(record.latch_canceled());
        assert!(!record.latch_canceled());
        assert!(record.start_emitted());
    }

    #[test]
    fn records_are_removed_on_terminal_outcome() {
        let table = PendingTable::new();
        table.register(request(1));
        table.register(request(2));
        assert_eq!(table.len(), 2);
        assert!(table.remove(RequestId(1)).is_some());
        assert!(table.get(RequestId(1)).is_none());
        assert_eq!(table.ids(), vec![RequestId(2)]);
    }
}
