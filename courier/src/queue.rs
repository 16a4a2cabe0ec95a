//! Bounded FIFO request queue.
//!
//! A counting semaphore with cancellable waiters. Admission is strictly
//! FIFO among waiters that stay live; a waiter whose signal fires is
//! removed and fails with [`QueueError::AbortedWhileWaiting`]. Permits are
//! released at most once (explicitly or on drop), and every release wakes
//! at most one live waiter, skipping aborted ones in a single pass.
//!
//! State changes publish a [`QueueStats`] snapshot through a
//! [`watch`](tokio::sync::watch) channel; subscribers observe the current
//! snapshot on attach.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use smol_str::SmolStr;
use thiserror::Error;
use tokio::sync::{oneshot, watch};

use courier_core::AbortSignal;

/// Queue-level acquisition failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue was closed (or cleared) with the given reason.
    #[error("queue closed: {reason}")]
    Closed {
        /// Reason passed to `close` or `clear`.
        reason: SmolStr,
    },

    /// The waiter's signal fired before a permit was granted.
    #[error("aborted while waiting for a permit")]
    AbortedWhileWaiting,
}

/// Point-in-time queue snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStats {
    /// Permits currently held.
    pub active: usize,
    /// Waiters currently enqueued.
    pub pending: usize,
    /// Maximum concurrent permits.
    pub capacity: usize,
    /// Whether `close` has been called.
    pub is_closed: bool,
}

type Grant = Result<(), QueueError>;

#[derive(Debug)]
struct Waiter {
    id: u64,
    tx: oneshot::Sender<Grant>,
    signal: Option<AbortSignal>,
}

#[derive(Debug)]
struct State {
    active: usize,
    waiters: VecDeque<Waiter>,
    closed: Option<SmolStr>,
    next_waiter: u64,
}

#[derive(Debug)]
struct Inner {
    capacity: usize,
    state: Mutex<State>,
    stats: watch::Sender<QueueStats>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.stats.send_replace(QueueStats {
            active: state.active,
            pending: state.waiters.len(),
            capacity: self.capacity,
            is_closed: state.closed.is_some(),
        });
    }

    /// Gives one permit back and hands it to the first live waiter.
    fn release(self: &Arc<Self>) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        loop {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            if waiter.signal.as_ref().is_some_and(AbortSignal::is_aborted) {
                // Aborted waiters are popped here in one pass; their own
                // cancel path reports the failure.
                continue;
            }
            if waiter.tx.send(Ok(())).is_ok() {
                state.active += 1;
                break;
            }
            // Receiver vanished between the abort check and the send;
            // keep scanning so the release is not lost.
        }
        self.publish(&state);
    }
}

/// FIFO counting semaphore over request slots.
#[derive(Clone)]
pub struct RequestQueue {
    inner: Arc<Inner>,
}

impl RequestQueue {
    /// A queue admitting `capacity` concurrent permits.
    pub fn new(capacity: usize) -> Self {
        let (stats, _) = watch::channel(QueueStats {
            active: 0,
            pending: 0,
            capacity,
            is_closed: false,
        });
        RequestQueue {
            inner: Arc::new(Inner {
                capacity,
                state: Mutex::new(State {
                    active: 0,
                    waiters: VecDeque::new(),
                    closed: None,
                    next_waiter: 0,
                }),
                stats,
            }),
        }
    }

    /// Acquires a permit, waiting FIFO behind earlier callers.
    ///
    /// An already-triggered signal fails immediately; a closed queue fails
    /// with [`QueueError::Closed`].
    pub async fn acquire(&self, signal: Option<AbortSignal>) -> Result<Permit, QueueError> {
        let (id, mut rx) = {
            let mut state = self.inner.lock();
            if let Some(reason) = &state.closed {
                return Err(QueueError::Closed {
                    reason: reason.clone(),
                });
            }
            if signal.as_ref().is_some_and(AbortSignal::is_aborted) {
                return Err(QueueError::AbortedWhileWaiting);
            }
            if state.active < self.inner.capacity {
                state.active += 1;
                self.inner.publish(&state);
                return Ok(Permit::new(Arc::clone(&self.inner)));
            }
            let (tx, rx) = oneshot::channel();
            let id = state.next_waiter;
            state.next_waiter += 1;
            state.waiters.push_back(Waiter {
                id,
                tx,
                signal: signal.clone(),
            });
            self.inner.publish(&state);
            (id, rx)
        };

        match signal {
            Some(signal) => {
                let granted = tokio::select! {
                    granted = &mut rx => Some(granted),
                    _ = signal.cancelled() => None,
                };
                match granted {
                    Some(granted) => self.finish(granted),
                    None => self.abort_wait(id, rx),
                }
            }
            None => {
                let granted = rx.await;
                self.finish(granted)
            }
        }
    }

    /// Non-blocking acquisition; never enqueues.
    pub fn try_acquire(&self) -> Option<Permit> {
        let mut state = self.inner.lock();
        if state.closed.is_some() || state.active >= self.inner.capacity {
            return None;
        }
        state.active += 1;
        self.inner.publish(&state);
        Some(Permit::new(Arc::clone(&self.inner)))
    }

    /// Rejects all waiters and all future `acquire` calls.
    pub fn close(&self, reason: impl Into<SmolStr>) {
        let reason = reason.into();
        let mut state = self.inner.lock();
        state.closed = Some(reason.clone());
        Self::reject_waiters(&mut state, &reason);
        self.inner.publish(&state);
    }

    /// Rejects current waiters; future `acquire` calls proceed normally.
    pub fn clear(&self, reason: impl Into<SmolStr>) {
        let reason = reason.into();
        let mut state = self.inner.lock();
        Self::reject_waiters(&mut state, &reason);
        self.inner.publish(&state);
    }

    /// Current snapshot.
    pub fn stats(&self) -> QueueStats {
        self.inner.stats.borrow().clone()
    }

    /// Stats stream; the receiver starts at the current snapshot.
    pub fn subscribe(&self) -> watch::Receiver<QueueStats> {
        self.inner.stats.subscribe()
    }

    fn reject_waiters(state: &mut State, reason: &SmolStr) {
        for waiter in state.waiters.drain(..) {
            let _ = waiter.tx.send(Err(QueueError::Closed {
                reason: reason.clone(),
            }));
        }
    }

    fn finish(
        &self,
        granted: Result<Grant, oneshot::error::RecvError>,
    ) -> Result<Permit, QueueError> {
        match granted {
            Ok(Ok(())) => Ok(Permit::new(Arc::clone(&self.inner))),
            Ok(Err(err)) => Err(err),
            // Sender dropped without a grant: the waiter was discarded as
            // aborted during a release pass.
            Err(_) => Err(QueueError::AbortedWhileWaiting),
        }
    }

    fn abort_wait(&self, id: u64, mut rx: oneshot::Receiver<Grant>) -> Result<Permit, QueueError> {
        {
            let mut state = self.inner.lock();
            if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                state.waiters.remove(pos);
                self.inner.publish(&state);
                return Err(QueueError::AbortedWhileWaiting);
            }
        }
        // Not in the queue anymore: a grant or rejection raced the abort.
        // A granted permit must flow back so the slot is not lost.
        match rx.try_recv() {
            Ok(Ok(())) => {
                drop(Permit::new(Arc::clone(&self.inner)));
                Err(QueueError::AbortedWhileWaiting)
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(QueueError::AbortedWhileWaiting),
        }
    }
}

impl std::fmt::Debug for RequestQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let stats = self.stats();
        f.debug_struct("RequestQueue")
            .field("active", &stats.active)
            .field("pending", &stats.pending)
            .field("capacity", &stats.capacity)
            .field("is_closed", &stats.is_closed)
            .finish()
    }
}

/// One unit of queue capacity.
///
/// Released at most once: explicitly via [`Permit::release`] or on drop.
#[derive(Debug)]
pub struct Permit {
    inner: Option<Arc<Inner>>,
}

impl Permit {
    fn new(inner: Arc<Inner>) -> Self {
        Permit { inner: Some(inner) }
    }

    /// Releases the permit, waking the first live waiter.
    pub fn release(mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.release();
        }
    }
}
