//! Cancellation primitives.
//!
//! [`AbortController`] owns the abort latch for one in-flight request;
//! [`AbortSignal`] is the cheaply clonable observer side handed to the
//! queue, the adapter, and the retry sleep. Signals compose with
//! [`AbortSignal::any`]: the composed signal fires when any source fires,
//! and attribution reports the first source that latched.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::Poll;

use smol_str::SmolStr;
use tokio::sync::Notify;

/// Which source triggered an abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortOrigin {
    /// `cancel(id)` was called on the orchestrator.
    User,
    /// The caller-supplied signal fired.
    External,
    /// The request deadline fired.
    Timeout,
}

impl fmt::Display for AbortOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortOrigin::User => f.write_str("user"),
            AbortOrigin::External => f.write_str("external"),
            AbortOrigin::Timeout => f.write_str("timeout"),
        }
    }
}

/// The latched cause of an abort.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbortReason {
    /// Source that fired.
    pub origin: AbortOrigin,
    /// Optional human-readable message.
    pub message: Option<SmolStr>,
}

impl AbortReason {
    /// Reason with an origin and no message.
    pub fn new(origin: AbortOrigin) -> Self {
        AbortReason {
            origin,
            message: None,
        }
    }

    /// Reason with an origin and a message.
    pub fn with_message(origin: AbortOrigin, message: impl Into<SmolStr>) -> Self {
        AbortReason {
            origin,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    reason: OnceLock<AbortReason>,
    notify: Notify,
}

impl Shared {
    fn abort(&self, reason: AbortReason) -> bool {
        let latched = self.reason.set(reason).is_ok();
        // Wake waiters even on a lost race; the first reason stands.
        self.notify.notify_waiters();
        latched
    }

    async fn cancelled(&self) {
        loop {
            if self.reason.get().is_some() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering: an abort between the first check
            // and `notified()` would otherwise be missed.
            if self.reason.get().is_some() {
                return;
            }
            notified.await;
        }
    }
}

/// Owner side of an abort latch.
///
/// Aborting is idempotent: the first reason wins and later calls are
/// ignored, which is what gives `abortedBy` attribution its precision.
#[derive(Debug, Clone, Default)]
pub struct AbortController {
    shared: Arc<Shared>,
}

impl AbortController {
    /// Creates a fresh, untriggered controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer signal for this controller.
    pub fn signal(&self) -> AbortSignal {
        AbortSignal {
            inner: SignalInner::Single(Arc::clone(&self.shared)),
        }
    }

    /// Fires the latch. Returns `true` if this call latched the reason,
    /// `false` if the controller had already fired.
    pub fn abort(&self, reason: AbortReason) -> bool {
        self.shared.abort(reason)
    }

    /// Whether the controller has fired.
    pub fn is_aborted(&self) -> bool {
        self.shared.reason.get().is_some()
    }

    /// The latched reason, if the controller has fired.
    pub fn reason(&self) -> Option<AbortReason> {
        self.shared.reason.get().cloned()
    }
}

#[derive(Debug, Clone)]
enum SignalInner {
    Single(Arc<Shared>),
    Any(Arc<[Arc<Shared>]>),
}

/// Observer side of one or more abort latches.
#[derive(Debug, Clone)]
pub struct AbortSignal {
    inner: SignalInner,
}

impl AbortSignal {
    /// A signal composed from several sources; it is aborted as soon as
    /// any source is.
    ///
    /// Composition flattens to the leaf latches and is pure observation:
    /// nothing is spawned and nothing needs unbinding when the composed
    /// signal is dropped.
    pub fn any<I>(signals: I) -> AbortSignal
    where
        I: IntoIterator<Item = AbortSignal>,
    {
        let mut sources: Vec<Arc<Shared>> = Vec::new();
        for signal in signals {
            match signal.inner {
                SignalInner::Single(shared) => sources.push(shared),
                SignalInner::Any(children) => sources.extend(children.iter().cloned()),
            }
        }
        AbortSignal {
            inner: SignalInner::Any(sources.into()),
        }
    }

    /// Whether any source has fired.
    pub fn is_aborted(&self) -> bool {
        match &self.inner {
            SignalInner::Single(shared) => shared.reason.get().is_some(),
            SignalInner::Any(sources) => {
                sources.iter().any(|shared| shared.reason.get().is_some())
            }
        }
    }

    /// The reason of the first source observed to have fired.
    pub fn reason(&self) -> Option<AbortReason> {
        match &self.inner {
            SignalInner::Single(shared) => shared.reason.get().cloned(),
            SignalInner::Any(sources) => {
                sources.iter().find_map(|shared| shared.reason.get().cloned())
            }
        }
    }

    /// Resolves when the signal aborts; immediately if it already has.
    pub async fn cancelled(&self) {
        match &self.inner {
            SignalInner::Single(shared) => shared.cancelled().await,
            SignalInner::Any(sources) => {
                if sources.is_empty() {
                    // An empty composition can never fire.
                    std::future::pending::<()>().await;
                }
                let waits = sources
                    .iter()
                    .map(|shared| {
                        Box::pin(shared.cancelled())
                            as Pin<Box<dyn Future<Output = ()> + Send + '_>>
                    })
                    .collect::<Vec<_>>();
                select_any(waits).await;
            }
        }
    }
}

/// Minimal any-of wait over boxed unit futures.
///
/// Polls every source each wakeup; composition widths here are two or
/// three signals, so the linear scan is the simple correct choice.
async fn select_any(mut waits: Vec<Pin<Box<dyn Future<Output = ()> + Send + '_>>>) {
    std::future::poll_fn(move |cx| {
        for wait in waits.iter_mut() {
            if wait.as_mut().poll(cx).is_ready() {
                return Poll::Ready(());
            }
        }
        Poll::Pending
    })
    .await
}
