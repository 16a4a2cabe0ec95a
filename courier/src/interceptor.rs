//! Interceptor pipeline.
//!
//! Ordered request/response/error transformers. Request hooks run by
//! weight descending, response hooks by weight ascending so request
//! wrappers unwind LIFO, and error hooks in reverse registration order,
//! best-effort.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use tracing::debug;

use courier_core::{Error, Request, Response};

/// A request/response/error transformer. All hooks are optional; the
/// default implementations pass values through untouched.
#[async_trait]
pub trait Interceptor: Send + Sync {
    /// Ordering weight. Request hooks run weight-descending, response
    /// hooks weight-ascending.
    fn weight(&self) -> i32 {
        0
    }

    /// Transforms an outgoing request before dispatch.
    async fn on_request(&self, request: Request) -> Result<Request, Error> {
        Ok(request)
    }

    /// Transforms a validated response before it reaches the caller.
    async fn on_response(&self, response: Response) -> Result<Response, Error> {
        Ok(response)
    }

    /// Observes a terminal error. Failures here are swallowed.
    async fn on_error(&self, _error: &Error) -> Result<(), Error> {
        Ok(())
    }
}

/// Identifier for one registered interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterceptorId(u64);

struct Registered {
    id: InterceptorId,
    seq: u64,
    interceptor: Arc<dyn Interceptor>,
}

/// Registration-ordered interceptor list.
#[derive(Default)]
pub struct InterceptorStack {
    entries: Mutex<Vec<Registered>>,
    next_id: AtomicU64,
}

impl InterceptorStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Registered>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an interceptor.
    pub fn add(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        let seq = self.next_id.fetch_add(1, Ordering::Relaxed);
        let id = InterceptorId(seq);
        self.lock().push(Registered {
            id,
            seq,
            interceptor,
        });
        id
    }

    /// Removes an interceptor. Returns whether it existed.
    pub fn remove(&self, id: InterceptorId) -> bool {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|e| e.id != id);
        entries.len() != before
    }

    fn snapshot(&self) -> Vec<(i32, u64, Arc<dyn Interceptor>)> {
        self.lock()
            .iter()
            .map(|e| (e.interceptor.weight(), e.seq, Arc::clone(&e.interceptor)))
            .collect()
    }

    /// Runs request hooks, weight descending (registration order within a
    /// weight).
    pub async fn run_request(&self, mut request: Request) -> Result<Request, Error> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        for (_, _, interceptor) in entries {
            request = interceptor.on_request(request).await?;
        }
        Ok(request)
    }

    /// Runs response hooks, weight ascending, so request-side wrappers
    /// unwind LIFO.
    pub async fn run_response(&self, mut response: Response) -> Result<Response, Error> {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
        for (_, _, interceptor) in entries {
            response = interceptor.on_response(response).await?;
        }
        Ok(response)
    }

    /// Runs error hooks in reverse registration order; their own failures
    /// are swallowed.
    pub async fn run_error(&self, error: &Error) {
        let mut entries = self.snapshot();
        entries.sort_by(|a, b| b.1.cmp(&a.1));
        for (_, _, interceptor) in entries {
            if let Err(err) = interceptor.on_error(error).await {
                debug!(%err, "error interceptor failed; ignoring");
            }
        }
    }
}
