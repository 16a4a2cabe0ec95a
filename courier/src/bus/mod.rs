//! Typed event bus.
//!
//! Pub/sub keyed by event name with three subscription kinds — exact,
//! any, and pattern — plus two ordered middleware chains: a global chain
//! around all dispatch and a pattern chain around pattern-handler
//! dispatch.
//!
//! Ordering within one emission is fixed: global middleware wraps
//! (exact handlers → any handlers → pattern middleware wrapping pattern
//! handlers). Pattern handlers run priority-descending, insertion order
//! within a priority.
//!
//! Failure isolation: a handler error is logged and never reaches the
//! emitter nor sibling handlers. A middleware calling `next()` twice is a
//! programming error that fails the whole emission.

mod pattern;

pub use pattern::Pattern;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::{Map, Value};
use smol_str::SmolStr;
use thiserror::Error;
use tracing::error;

use courier_core::BoxError;

/// Event names are small interned strings (`request:start`, `cache:hit`).
pub type EventName = SmolStr;

/// Emission failures. Handler errors never surface here; these are
/// contract violations in middleware or subscription arguments.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BusError {
    /// A middleware invoked `next()` more than once.
    #[error("middleware invoked next() more than once in a single emission")]
    NextReentered,

    /// A pattern literal was neither `*` nor `prefix:*`.
    #[error("invalid subscription pattern `{0}`")]
    InvalidPattern(String),
}

/// Identifier for one subscription; pass to [`EventBus::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Identifier for one registered middleware.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MiddlewareId(u64);

/// An event handler.
///
/// Errors are isolated per handler: they are logged and do not abort the
/// emission or sibling handlers.
#[async_trait]
pub trait Handler<P>: Send + Sync {
    /// Handles one emission.
    async fn call(&self, event: &EventName, payload: &P) -> Result<(), BoxError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<P, F> Handler<P> for FnHandler<F>
where
    P: Send + Sync,
    F: Fn(&EventName, &P) + Send + Sync,
{
    async fn call(&self, event: &EventName, payload: &P) -> Result<(), BoxError> {
        (self.0)(event, payload);
        Ok(())
    }
}

/// Wraps a synchronous closure as a [`Handler`].
pub fn handler_fn<P, F>(f: F) -> Arc<dyn Handler<P>>
where
    P: Send + Sync + 'static,
    F: Fn(&EventName, &P) + Send + Sync + 'static,
{
    Arc::new(FnHandler(f))
}

/// Mutable context threaded through a middleware chain.
pub struct EmitContext<P> {
    /// Name of the event being emitted.
    pub event: EventName,
    /// The emitted payload.
    pub payload: P,
    /// Highest-priority matching pattern; set while the pattern chain
    /// runs, `None` in the global chain.
    pub matched: Option<Pattern>,
    /// Scratch space shared along the chain.
    pub meta: Map<String, Value>,
    /// Set to `true` to skip the remaining chain and all handlers not yet
    /// called.
    pub blocked: bool,
}

/// A chain transformer running around handler dispatch.
#[async_trait]
pub trait Middleware<P>: Send + Sync {
    /// Wraps the rest of the emission. Call `next.run(ctx)` exactly once
    /// to continue; skipping it (or setting `ctx.blocked`) stops the
    /// emission.
    async fn handle(
        &self,
        ctx: &mut EmitContext<P>,
        next: &mut Next<'_, P>,
    ) -> Result<(), BusError>;
}

#[async_trait]
trait Stage<P>: Send {
    async fn call(&mut self, ctx: &mut EmitContext<P>) -> Result<(), BusError>;
}

/// Continuation token for the remainder of a middleware chain.
pub struct Next<'a, P> {
    chain: &'a [Arc<dyn Middleware<P>>],
    stage: &'a mut (dyn Stage<P> + 'a),
    called: bool,
}

impl<'a, P> Next<'a, P>
where
    P: Send + Sync + 'static,
{
    /// Continues the emission: the next middleware, or handler dispatch
    /// when the chain is exhausted. At most once per middleware.
    pub fn run<'s>(
        &'s mut self,
        ctx: &'s mut EmitContext<P>,
    ) -> BoxFuture<'s, Result<(), BusError>> {
        Box::pin(async move {
            if self.called {
                return Err(BusError::NextReentered);
            }
            self.called = true;
            if ctx.blocked {
                return Ok(());
            }
            match self.chain.split_first() {
                Some((middleware, rest)) => {
                    let mut next = Next {
                        chain: rest,
                        stage: &mut *self.stage,
                        called: false,
                    };
                    middleware.handle(ctx, &mut next).await
                }
                None => self.stage.call(ctx).await,
            }
        })
    }
}

struct HandlerEntry<P> {
    id: SubscriptionId,
    handler: Arc<dyn Handler<P>>,
    once: bool,
}

// Manual impls: `P` itself is never cloned, only `Arc` handles are.
impl<P> Clone for HandlerEntry<P> {
    fn clone(&self) -> Self {
        HandlerEntry {
            id: self.id,
            handler: Arc::clone(&self.handler),
            once: self.once,
        }
    }
}

struct PatternEntry<P> {
    entry: HandlerEntry<P>,
    pattern: Pattern,
    priority: i32,
}

impl<P> Clone for PatternEntry<P> {
    fn clone(&self) -> Self {
        PatternEntry {
            entry: self.entry.clone(),
            pattern: self.pattern.clone(),
            priority: self.priority,
        }
    }
}

/// Options for pattern subscriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PatternOptions {
    /// Dispatch priority; higher runs first, insertion ties preserved.
    pub priority: i32,
    /// Unsubscribe after the first delivery.
    pub once: bool,
}

struct SubTable<P> {
    exact: HashMap<EventName, Vec<HandlerEntry<P>>>,
    any: Vec<HandlerEntry<P>>,
    patterns: Vec<PatternEntry<P>>,
}

impl<P> Default for SubTable<P> {
    fn default() -> Self {
        SubTable {
            exact: HashMap::new(),
            any: Vec::new(),
            patterns: Vec::new(),
        }
    }
}

struct BusInner<P> {
    subs: Mutex<SubTable<P>>,
    global_chain: Mutex<Vec<(MiddlewareId, Arc<dyn Middleware<P>>)>>,
    pattern_chain: Mutex<Vec<(MiddlewareId, Arc<dyn Middleware<P>>)>>,
    next_id: AtomicU64,
}

/// Type-keyed pub/sub with middleware and pattern subscriptions.
pub struct EventBus<P> {
    inner: Arc<BusInner<P>>,
}

impl<P> Clone for EventBus<P> {
    fn clone(&self) -> Self {
        EventBus {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P> Default for EventBus<P>
where
    P: Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P> EventBus<P>
where
    P: Send + Sync + 'static,
{
    /// An empty bus.
    pub fn new() -> Self {
        EventBus {
            inner: Arc::new(BusInner {
                subs: Mutex::new(SubTable::default()),
                global_chain: Mutex::new(Vec::new()),
                pattern_chain: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    fn fresh_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Subscribes to one event name.
    pub fn on(&self, event: impl Into<EventName>, handler: Arc<dyn Handler<P>>) -> SubscriptionId {
        self.subscribe_exact(event.into(), handler, false)
    }

    /// Subscribes to one event name for a single delivery.
    pub fn once(
        &self,
        event: impl Into<EventName>,
        handler: Arc<dyn Handler<P>>,
    ) -> SubscriptionId {
        self.subscribe_exact(event.into(), handler, true)
    }

    fn subscribe_exact(
        &self,
        event: EventName,
        handler: Arc<dyn Handler<P>>,
        once: bool,
    ) -> SubscriptionId {
        let id = SubscriptionId(self.fresh_id());
        lock(&self.inner.subs)
            .exact
            .entry(event)
            .or_default()
            .push(HandlerEntry { id, handler, once });
        id
    }

    /// Subscribes to every emission.
    pub fn on_any(&self, handler: Arc<dyn Handler<P>>) -> SubscriptionId {
        let id = SubscriptionId(self.fresh_id());
        lock(&self.inner.subs).any.push(HandlerEntry {
            id,
            handler,
            once: false,
        });
        id
    }

    /// Subscribes to a pattern (`*` or `prefix:*`) with default options.
    pub fn on_pattern(
        &self,
        pattern: &str,
        handler: Arc<dyn Handler<P>>,
    ) -> Result<SubscriptionId, BusError> {
        self.on_pattern_with(pattern, PatternOptions::default(), handler)
    }

    /// Subscribes to a pattern with priority and `once` options.
    pub fn on_pattern_with(
        &self,
        pattern: &str,
        options: PatternOptions,
        handler: Arc<dyn Handler<P>>,
    ) -> Result<SubscriptionId, BusError> {
        let pattern = Pattern::parse(pattern)?;
        let id = SubscriptionId(self.fresh_id());
        lock(&self.inner.subs).patterns.push(PatternEntry {
            entry: HandlerEntry {
                id,
                handler,
                once: options.once,
            },
            pattern,
            priority: options.priority,
        });
        Ok(id)
    }

    /// Releases one subscription. Returns whether it existed.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut subs = lock(&self.inner.subs);
        let mut removed = false;
        subs.exact.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.id != id);
            removed |= entries.len() != before;
            !entries.is_empty()
        });
        let before = subs.any.len();
        subs.any.retain(|e| e.id != id);
        removed |= subs.any.len() != before;
        let before = subs.patterns.len();
        subs.patterns.retain(|e| e.entry.id != id);
        removed |= subs.patterns.len() != before;
        removed
    }

    /// Appends a middleware to the global chain.
    pub fn use_middleware(&self, middleware: Arc<dyn Middleware<P>>) -> MiddlewareId {
        let id = MiddlewareId(self.fresh_id());
        lock(&self.inner.global_chain).push((id, middleware));
        id
    }

    /// Appends a middleware to the pattern chain.
    pub fn use_pattern_middleware(&self, middleware: Arc<dyn Middleware<P>>) -> MiddlewareId {
        let id = MiddlewareId(self.fresh_id());
        lock(&self.inner.pattern_chain).push((id, middleware));
        id
    }

    /// Removes a middleware from either chain.
    pub fn remove_middleware(&self, id: MiddlewareId) -> bool {
        let mut removed = false;
        for chain in [&self.inner.global_chain, &self.inner.pattern_chain] {
            let mut chain = lock(chain);
            let before = chain.len();
            chain.retain(|(mid, _)| *mid != id);
            removed |= chain.len() != before;
        }
        removed
    }

    /// Fire-and-forget emission. The dispatch runs on a spawned task;
    /// chain failures are logged.
    pub fn emit(&self, event: impl Into<EventName>, payload: P) {
        let bus = self.clone();
        let event = event.into();
        tokio::spawn(async move {
            if let Err(err) = bus.emit_and_wait(event.clone(), payload).await {
                error!(%event, %err, "event emission failed");
            }
        });
    }

    /// Awaitable emission: resolves when the chain and every handler have
    /// completed.
    pub async fn emit_and_wait(
        &self,
        event: impl Into<EventName>,
        payload: P,
    ) -> Result<(), BusError> {
        let event = event.into();
        let global = {
            let chain = lock(&self.inner.global_chain);
            chain.iter().map(|(_, mw)| Arc::clone(mw)).collect::<Vec<_>>()
        };
        let pattern_chain = {
            let chain = lock(&self.inner.pattern_chain);
            chain.iter().map(|(_, mw)| Arc::clone(mw)).collect::<Vec<_>>()
        };
        let (exact, any, patterns) = {
            let subs = lock(&self.inner.subs);
            let exact = subs.exact.get(&event).cloned().unwrap_or_default();
            let any = subs.any.clone();
            let mut patterns: Vec<(usize, PatternEntry<P>)> = subs
                .patterns
                .iter()
                .enumerate()
                .filter(|(_, p)| p.pattern.matches(&event))
                .map(|(seq, p)| (seq, p.clone()))
                .collect();
            // Priority descending; insertion order inside a priority.
            patterns.sort_by(|a, b| b.1.priority.cmp(&a.1.priority).then(a.0.cmp(&b.0)));
            (exact, any, patterns.into_iter().map(|(_, p)| p).collect::<Vec<_>>())
        };

        let mut ctx = EmitContext {
            event,
            payload,
            matched: None,
            meta: Map::new(),
            blocked: false,
        };
        let mut fired_once = Vec::new();
        let mut stage = DispatchStage {
            exact: &exact,
            any: &any,
            patterns: &patterns,
            pattern_chain: &pattern_chain,
            fired_once: &mut fired_once,
        };
        let result = {
            let mut next = Next {
                chain: &global,
                stage: &mut stage,
                called: false,
            };
            next.run(&mut ctx).await
        };
        for id in fired_once {
            self.off(id);
        }
        result
    }
}

async fn run_handler<P: Send + Sync>(entry: &HandlerEntry<P>, ctx: &EmitContext<P>) {
    if let Err(err) = entry.handler.call(&ctx.event, &ctx.payload).await {
        // Isolation: a failing handler never aborts siblings or the chain.
        error!(event = %ctx.event, %err, "event handler failed");
    }
}

struct DispatchStage<'a, P> {
    exact: &'a [HandlerEntry<P>],
    any: &'a [HandlerEntry<P>],
    patterns: &'a [PatternEntry<P>],
    pattern_chain: &'a [Arc<dyn Middleware<P>>],
    fired_once: &'a mut Vec<SubscriptionId>,
}

#[async_trait]
impl<'a, P> Stage<P> for DispatchStage<'a, P>
where
    P: Send + Sync + 'static,
{
    async fn call(&mut self, ctx: &mut EmitContext<P>) -> Result<(), BusError> {
        for entry in self.exact {
            if ctx.blocked {
                return Ok(());
            }
            run_handler(entry, ctx).await;
            if entry.once {
                self.fired_once.push(entry.id);
            }
        }
        for entry in self.any {
            if ctx.blocked {
                return Ok(());
            }
            run_handler(entry, ctx).await;
            if entry.once {
                self.fired_once.push(entry.id);
            }
        }
        if self.patterns.is_empty() || ctx.blocked {
            return Ok(());
        }
        ctx.matched = Some(self.patterns[0].pattern.clone());
        let mut stage = PatternStage {
            patterns: self.patterns,
            fired_once: &mut *self.fired_once,
        };
        let mut next = Next {
            chain: self.pattern_chain,
            stage: &mut stage,
            called: false,
        };
        let result = next.run(ctx).await;
        ctx.matched = None;
        result
    }
}

struct PatternStage<'a, P> {
    patterns: &'a [PatternEntry<P>],
    fired_once: &'a mut Vec<SubscriptionId>,
}

#[async_trait]
impl<'a, P> Stage<P> for PatternStage<'a, P>
where
    P: Send + Sync + 'static,
{
    async fn call(&mut self, ctx: &mut EmitContext<P>) -> Result<(), BusError> {
        for entry in self.patterns {
            if ctx.blocked {
                return Ok(());
            }
            run_handler(&entry.entry, ctx).await;
            if entry.entry.once {
                self.fired_once.push(entry.entry.id);
            }
        }
        Ok(())
    }
}
