//! The request orchestrator.
//!
//! [`Client`] is the façade callers talk to. Per logical request it walks
//! a fixed sequence of steps: prepare (merge defaults, resolve the URL,
//! assign an id), run request interceptors, probe the cache, acquire a
//! queue permit under the composed cancellation signal, execute attempts
//! through the adapter, classify outcomes, retry with backoff, and
//! finalize — releasing the permit, removing the pending record, and
//! emitting `request:end` exactly once.
//!
//! Every lifecycle event for a request is emitted from that request's own
//! task, which is what makes the per-request event order total:
//! `cache:*` (probe time) ≺ `start` ≺ `retry:attempt`* ≺ terminal event ≺
//! `end`.

mod pending;

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use http::{HeaderMap, Method, StatusCode};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use courier_core::{
    AbortOrigin, AbortReason, AbortSignal, Adapter, AdapterError, CacheKey, CacheOptions, Error,
    Request, RequestId, Response, RetryOptions, StatusValidator,
};

use crate::bus::{EventBus, EventName, Handler, SubscriptionId};
use crate::cache::policy::HttpCachePolicy;
use crate::cache::store::{CacheLookup, CacheStats, CacheStore};
use crate::config::ClientConfig;
use crate::events::{EventPayload, names};
use crate::interceptor::{Interceptor, InterceptorId, InterceptorStack};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::offload::OffloadManager;
use crate::queue::{Permit, QueueError, QueueStats, RequestQueue};
use crate::retry::RetryPolicy;

use pending::{PendingRecord, PendingTable};

/// One logical request as submitted by the caller; defaults are merged in
/// during preparation.
#[derive(Clone, Default)]
pub struct RequestOptions {
    /// HTTP method.
    pub method: Method,
    /// Absolute URL, or a path resolved against the configured base.
    pub url: String,
    /// Extra headers; win over configured defaults.
    pub headers: HeaderMap,
    /// Structured query parameters appended to the URL.
    pub params: Option<Map<String, Value>>,
    /// Request body.
    pub body: Option<Bytes>,
    /// Attempt timeout override.
    pub timeout: Option<Duration>,
    /// Retry overrides.
    pub retry: RetryOptions,
    /// Cache behavior overrides.
    pub cache: CacheOptions,
    /// Explicit cache fingerprint.
    pub cache_key: Option<CacheKey>,
    /// Caller-owned cancellation signal.
    pub signal: Option<AbortSignal>,
    /// Status validation override.
    pub validate_status: Option<StatusValidator>,
    /// Free-form metadata stamped onto the request.
    pub metadata: Option<Value>,
}

impl RequestOptions {
    /// Options for `method` and `url`.
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        RequestOptions {
            method,
            url: url.into(),
            ..RequestOptions::default()
        }
    }

    /// GET options.
    pub fn get(url: impl Into<String>) -> Self {
        Self::new(Method::GET, url)
    }

    /// POST options with a body.
    pub fn post(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        RequestOptions {
            body: Some(body.into()),
            ..Self::new(Method::POST, url)
        }
    }

    /// PUT options with a body.
    pub fn put(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        RequestOptions {
            body: Some(body.into()),
            ..Self::new(Method::PUT, url)
        }
    }

    /// PATCH options with a body.
    pub fn patch(url: impl Into<String>, body: impl Into<Bytes>) -> Self {
        RequestOptions {
            body: Some(body.into()),
            ..Self::new(Method::PATCH, url)
        }
    }

    /// DELETE options.
    pub fn delete(url: impl Into<String>) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// HEAD options.
    pub fn head(url: impl Into<String>) -> Self {
        Self::new(Method::HEAD, url)
    }
}

impl std::fmt::Debug for RequestOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestOptions")
            .field("method", &self.method)
            .field("url", &self.url)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

/// Marker type for unset builder fields.
pub struct NotSet;

/// Builder for [`Client`]. The adapter is required; everything else has
/// defaults.
pub struct ClientBuilder<A> {
    adapter: A,
    config: ClientConfig,
}

impl ClientBuilder<NotSet> {
    /// A builder with no adapter set.
    pub fn new() -> Self {
        ClientBuilder {
            adapter: NotSet,
            config: ClientConfig::default(),
        }
    }

    /// Sets the transport adapter.
    pub fn adapter<A>(self, adapter: A) -> ClientBuilder<Arc<dyn Adapter>>
    where
        A: Adapter + 'static,
    {
        ClientBuilder {
            adapter: Arc::new(adapter),
            config: self.config,
        }
    }
}

impl Default for ClientBuilder<NotSet> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> ClientBuilder<A> {
    /// Base URL request paths are resolved against.
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.config.base_url = Some(base_url.into());
        self
    }

    /// Headers merged into every request.
    pub fn default_headers(mut self, headers: HeaderMap) -> Self {
        self.config.default_headers = headers;
        self
    }

    /// Queue capacity (must be positive).
    pub fn concurrent_requests(mut self, capacity: usize) -> Self {
        self.config.concurrent_requests = capacity;
        self
    }

    /// Default attempt timeout; `None` disables it.
    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Default retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Enables or disables the cache layer.
    pub fn enable_cache(mut self, enabled: bool) -> Self {
        self.config.enable_cache = enabled;
        self
    }

    /// Fallback TTL for responses without freshness headers.
    pub fn default_cache_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_cache_ttl = ttl;
        self
    }

    /// Attach conditional headers on refetches.
    pub fn enable_conditional_requests(mut self, enabled: bool) -> Self {
        self.config.enable_conditional_requests = enabled;
        self
    }

    /// Emit `metrics:collect` periodically.
    pub fn enable_metrics(mut self, enabled: bool) -> Self {
        self.config.enable_metrics = enabled;
        self
    }

    /// Status validation applied when a request carries no override.
    pub fn validate_status(mut self, validator: StatusValidator) -> Self {
        self.config.validate_status = Some(validator);
        self
    }

    /// Custom retry decision; wins over the default classification.
    pub fn should_retry(mut self, decide: crate::config::ShouldRetry) -> Self {
        self.config.should_retry = Some(decide);
        self
    }
}

impl ClientBuilder<Arc<dyn Adapter>> {
    /// Validates the configuration and builds the client.
    ///
    /// Must be called inside a Tokio runtime when metrics are enabled:
    /// the periodic `metrics:collect` emitter is spawned here.
    pub fn build(self) -> Result<Client, Error> {
        self.config.validate()?;
        let enable_metrics = self.config.enable_metrics;
        let queue = RequestQueue::new(self.config.concurrent_requests);
        let policy = HttpCachePolicy::new(self.config.default_cache_ttl);
        let client = Client {
            inner: Arc::new(ClientInner {
                adapter: self.adapter,
                config: self.config,
                queue,
                cache: Arc::new(CacheStore::new()),
                policy,
                bus: EventBus::new(),
                interceptors: InterceptorStack::new(),
                pending: PendingTable::new(),
                offload: OffloadManager::new(),
                metrics: MetricsCollector::new(),
                next_id: AtomicU64::new(0),
                cleanups: Mutex::new(Vec::new()),
                destroyed: AtomicBool::new(false),
            }),
        };
        if enable_metrics {
            client.spawn_metrics_emitter();
        }
        Ok(client)
    }
}

struct ClientInner {
    adapter: Arc<dyn Adapter>,
    config: ClientConfig,
    queue: RequestQueue,
    cache: Arc<CacheStore>,
    policy: HttpCachePolicy,
    bus: EventBus<EventPayload>,
    interceptors: InterceptorStack,
    pending: PendingTable,
    offload: OffloadManager,
    metrics: MetricsCollector,
    next_id: AtomicU64,
    cleanups: Mutex<Vec<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Interval between `metrics:collect` emissions.
const METRICS_INTERVAL: Duration = Duration::from_secs(30);

/// Request orchestrator façade.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Starts a builder.
    pub fn builder() -> ClientBuilder<NotSet> {
        ClientBuilder::new()
    }

    // ---------------------------------------------------------------------
    // Public request surface
    // ---------------------------------------------------------------------

    /// Submits a logical request and drives it to a terminal outcome.
    pub async fn request(&self, options: RequestOptions) -> Result<Response, Error> {
        if self.inner.destroyed.load(Ordering::SeqCst) {
            return Err(Error::QueueClosed {
                reason: "client destroyed".into(),
            });
        }
        let request = self.prepare(options)?;
        self.inner.metrics.request_submitted();
        self.execute(request).await
    }

    /// GET convenience.
    pub async fn get(&self, url: impl Into<String>) -> Result<Response, Error> {
        self.request(RequestOptions::get(url)).await
    }

    /// POST convenience.
    pub async fn post(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Response, Error> {
        self.request(RequestOptions::post(url, body)).await
    }

    /// PUT convenience.
    pub async fn put(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Response, Error> {
        self.request(RequestOptions::put(url, body)).await
    }

    /// PATCH convenience.
    pub async fn patch(
        &self,
        url: impl Into<String>,
        body: impl Into<Bytes>,
    ) -> Result<Response, Error> {
        self.request(RequestOptions::patch(url, body)).await
    }

    /// DELETE convenience.
    pub async fn delete(&self, url: impl Into<String>) -> Result<Response, Error> {
        self.request(RequestOptions::delete(url)).await
    }

    /// HEAD convenience.
    pub async fn head(&self, url: impl Into<String>) -> Result<Response, Error> {
        self.request(RequestOptions::head(url)).await
    }

    // ---------------------------------------------------------------------
    // Cancellation
    // ---------------------------------------------------------------------

    /// Cancels one in-flight request. True the first time for a live
    /// request, false thereafter and for unknown ids.
    pub fn cancel(&self, id: RequestId, reason: Option<&str>) -> bool {
        let Some(record) = self.inner.pending.get(id) else {
            return false;
        };
        let abort_reason = match reason {
            Some(message) => AbortReason::with_message(AbortOrigin::User, message.to_owned()),
            None => AbortReason::new(AbortOrigin::User),
        };
        record.controller.abort(abort_reason)
    }

    /// Cancels every in-flight request.
    pub fn cancel_all(&self, reason: Option<&str>) {
        for id in self.inner.pending.ids() {
            self.cancel(id, reason);
        }
    }

    /// Number of in-flight logical requests.
    pub fn in_flight(&self) -> usize {
        self.inner.pending.len()
    }

    // ---------------------------------------------------------------------
    // Events and interceptors
    // ---------------------------------------------------------------------

    /// Subscribes to one event name.
    pub fn on(
        &self,
        event: impl Into<EventName>,
        handler: Arc<dyn Handler<EventPayload>>,
    ) -> SubscriptionId {
        self.inner.bus.on(event, handler)
    }

    /// Subscribes to one event name for a single delivery.
    pub fn once(
        &self,
        event: impl Into<EventName>,
        handler: Arc<dyn Handler<EventPayload>>,
    ) -> SubscriptionId {
        self.inner.bus.once(event, handler)
    }

    /// Releases a subscription.
    pub fn off(&self, id: SubscriptionId) -> bool {
        self.inner.bus.off(id)
    }

    /// The underlying event bus, for pattern subscriptions and middleware.
    pub fn bus(&self) -> &EventBus<EventPayload> {
        &self.inner.bus
    }

    /// Registers an interceptor.
    pub fn add_interceptor(&self, interceptor: Arc<dyn Interceptor>) -> InterceptorId {
        self.inner.interceptors.add(interceptor)
    }

    /// Removes an interceptor.
    pub fn remove_interceptor(&self, id: InterceptorId) -> bool {
        self.inner.interceptors.remove(id)
    }

    // ---------------------------------------------------------------------
    // Cache and metrics surface
    // ---------------------------------------------------------------------

    /// Invalidates one cache entry by fingerprint.
    pub fn invalidate_cache(&self, key: &CacheKey) -> bool {
        let removed = self.inner.cache.invalidate(key);
        if removed {
            self.inner.bus.emit(
                names::CACHE_INVALIDATED,
                EventPayload::Cache {
                    key: key.clone(),
                    request: None,
                },
            );
        }
        removed
    }

    /// Clears the cache.
    pub fn clear_cache(&self) {
        self.inner.cache.clear();
        self.inner.bus.emit(names::CACHE_CLEAR, EventPayload::CacheCleared);
    }

    /// Cache counters and size.
    pub fn cache_stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Point-in-time metrics snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner
            .metrics
            .snapshot(self.inner.cache.len(), &self.inner.queue.stats())
    }

    /// Zeroes the lifecycle counters.
    pub fn reset_metrics(&self) {
        self.inner.metrics.reset();
    }

    /// Current queue snapshot.
    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    /// Queue stats stream; the receiver starts at the current snapshot.
    pub fn subscribe_queue_stats(&self) -> tokio::sync::watch::Receiver<QueueStats> {
        self.inner.queue.subscribe()
    }

    /// Tears the client down: cancels all in-flight requests and
    /// background revalidations, closes the queue, clears the cache, and
    /// stops the periodic metrics emitter. Idempotent.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel_all(Some("client destroyed"));
        self.inner.queue.close("client destroyed");
        self.inner.offload.cancel_all();
        self.inner.cache.clear();
        for handle in lock(&self.inner.cleanups).drain(..) {
            handle.abort();
        }
    }

    // ---------------------------------------------------------------------
    // Preparation
    // ---------------------------------------------------------------------

    fn fresh_id(&self) -> RequestId {
        RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1)
    }

    fn prepare(&self, options: RequestOptions) -> Result<Request, Error> {
        if options.timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config {
                message: "request timeout must be positive".into(),
            });
        }
        if options.retry.jitter.is_some_and(|j| !(0.0..=1.0).contains(&j)) {
            return Err(Error::Config {
                message: "request retry jitter must be within [0, 1]".into(),
            });
        }
        let config = &self.inner.config;
        let url = resolve_url(
            config.base_url.as_deref(),
            &options.url,
            options.params.as_ref(),
        )?;

        let mut headers = config.default_headers.clone();
        for (name, value) in &options.headers {
            headers.insert(name.clone(), value.clone());
        }

        let mut request = Request::new(self.fresh_id(), options.method, url);
        request.headers = headers;
        request.params = options.params;
        request.body = options.body;
        request.timeout = options.timeout.or(config.timeout);
        request.retry = options.retry;
        request.cache = options.cache;
        request.cache_key = options.cache_key;
        request.signal = options.signal;
        request.validate_status = options.validate_status;
        request.meta.custom = options.metadata;
        Ok(request)
    }

    // ---------------------------------------------------------------------
    // Execution
    // ---------------------------------------------------------------------

    /// Drives one prepared request to its terminal outcome and performs
    /// finalization: the pending record is always removed and — for
    /// user-visible requests — `request:end` is emitted exactly once.
    async fn execute(&self, request: Request) -> Result<Response, Error> {
        let inner = &self.inner;
        let id = request.id;
        let is_revalidation = request.meta.is_revalidation;
        let record = inner.pending.register(Arc::new(request.clone()));

        // Whole-request deadline: armed only when the caller supplied no
        // signal of their own. It aborts the internal controller, so a
        // request stuck anywhere (queue, adapter, backoff sleep) unwinds.
        if request.signal.is_none() {
            if let Some(timeout) = request.timeout {
                let controller = record.controller.clone();
                let handle = tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    controller.abort(AbortReason::with_message(
                        AbortOrigin::Timeout,
                        "deadline elapsed",
                    ));
                });
                record.set_deadline(handle);
            }
        }

        let result = self.drive(request, &record).await;

        record.abort_deadline();
        inner.pending.remove(id);
        let snapshot = record.request();

        match &result {
            Ok(response) => {
                if !is_revalidation {
                    self.dispatch(
                        names::REQUEST_END,
                        EventPayload::Response {
                            request: Arc::clone(&snapshot),
                            response: Arc::new(response.clone()),
                        },
                    )
                    .await;
                }
            }
            Err(err) if err.is_canceled() => {
                if !is_revalidation {
                    if record.latch_canceled() {
                        self.dispatch(
                            names::REQUEST_CANCELED,
                            EventPayload::Request {
                                request: Arc::clone(&snapshot),
                            },
                        )
                        .await;
                    }
                    self.dispatch(
                        names::REQUEST_END,
                        EventPayload::Error {
                            request: Arc::clone(&snapshot),
                            error: Arc::new(err.clone()),
                        },
                    )
                    .await;
                }
            }
            Err(err) => {
                if !is_revalidation {
                    if err.is_timeout() {
                        inner.metrics.record_timeout();
                        if record.latch_timeout() {
                            self.dispatch(
                                names::TIMEOUT,
                                EventPayload::Request {
                                    request: Arc::clone(&snapshot),
                                },
                            )
                            .await;
                        }
                    }
                    // Cancellation skips error interceptors by design;
                    // every other terminal error runs them best-effort.
                    inner.interceptors.run_error(err).await;
                    let shared = Arc::new(err.clone());
                    self.dispatch(
                        names::RESPONSE_ERROR,
                        EventPayload::Error {
                            request: Arc::clone(&snapshot),
                            error: Arc::clone(&shared),
                        },
                    )
                    .await;
                    if matches!(err, Error::Network { .. }) {
                        self.dispatch(
                            names::CONNECTION_ERROR,
                            EventPayload::Error {
                                request: Arc::clone(&snapshot),
                                error: Arc::clone(&shared),
                            },
                        )
                        .await;
                    }
                    inner.metrics.record_error();
                    self.dispatch(
                        names::REQUEST_END,
                        EventPayload::Error {
                            request: snapshot,
                            error: shared,
                        },
                    )
                    .await;
                } else {
                    debug!(%id, %err, "background revalidation failed");
                }
            }
        }

        if !is_revalidation && record.start_emitted() {
            inner.metrics.request_finished();
        }
        result
    }

    /// The state walk up to a terminal outcome (the finalization around
    /// it lives in [`execute`](Self::execute)).
    async fn drive(
        &self,
        request: Request,
        record: &Arc<PendingRecord>,
    ) -> Result<Response, Error> {
        let inner = &self.inner;

        // Request interceptors may rewrite the request; re-snapshot it so
        // event payloads carry what was actually dispatched.
        let request = inner.interceptors.run_request(request).await?;
        let request = Arc::new(request);
        record.set_request(Arc::clone(&request));

        let cache_key = if inner.config.enable_cache && request.method == Method::GET {
            Some(self.probe_key(&request))
        } else {
            None
        };

        if inner.config.enable_cache && request.is_cache_probe_eligible() {
            if let Some(key) = &cache_key {
                match inner.cache.get(key) {
                    CacheLookup::Fresh(entry) => {
                        inner.metrics.record_cache_hit();
                        let response = response_from_entry(request.id, &entry);
                        self.dispatch(
                            names::CACHE_HIT,
                            EventPayload::Response {
                                request: Arc::clone(&request),
                                response: Arc::new(response.clone()),
                            },
                        )
                        .await;
                        return Ok(response);
                    }
                    CacheLookup::Stale(entry) => {
                        inner.metrics.record_cache_stale();
                        let response = response_from_entry(request.id, &entry);
                        self.dispatch(
                            names::CACHE_STALE,
                            EventPayload::Response {
                                request: Arc::clone(&request),
                                response: Arc::new(response.clone()),
                            },
                        )
                        .await;
                        if request.cache.revalidate_on_stale.unwrap_or(true) {
                            self.spawn_revalidation(&request, key.clone());
                        }
                        return Ok(response);
                    }
                    CacheLookup::Miss => {
                        inner.metrics.record_cache_miss();
                        self.dispatch(
                            names::CACHE_MISS,
                            EventPayload::Cache {
                                key: key.clone(),
                                request: Some(Arc::clone(&request)),
                            },
                        )
                        .await;
                    }
                }
            }
        }

        let internal = record.controller.signal();
        let composed = match &request.signal {
            Some(external) => AbortSignal::any([external.clone(), internal]),
            None => internal,
        };

        let permit: Permit = match inner.queue.acquire(Some(composed.clone())).await {
            Ok(permit) => permit,
            Err(QueueError::Closed { reason }) => return Err(Error::QueueClosed { reason }),
            Err(QueueError::AbortedWhileWaiting) => {
                return Err(self.abort_error(&request, record));
            }
        };

        if !request.meta.is_revalidation && record.latch_start() {
            inner.metrics.request_started();
            self.dispatch(
                names::REQUEST_START,
                EventPayload::Request {
                    request: Arc::clone(&request),
                },
            )
            .await;
        }

        let policy = inner.config.retry.with_overrides(&request.retry);
        let mut retries = 0u32;
        let result = loop {
            let mut attempt = (*request).clone();
            attempt.retry_count = retries;
            if inner.config.enable_conditional_requests && attempt.is_refetch() {
                if let Some(key) = &cache_key {
                    if let Some(entry) = inner.cache.peek(key) {
                        for (name, value) in HttpCachePolicy::conditional_headers(&entry) {
                            attempt.headers.insert(name, value);
                        }
                    }
                }
            }

            match self
                .run_attempt(&attempt, &composed, record, cache_key.as_ref())
                .await
            {
                Ok(response) => break Ok(response),
                Err(err) => {
                    if err.is_canceled() {
                        break Err(err);
                    }
                    // A fired deadline is terminal even though plain
                    // attempt timeouts are retryable.
                    let deadline_fired = record
                        .controller
                        .reason()
                        .is_some_and(|r| r.origin == AbortOrigin::Timeout);
                    if deadline_fired {
                        break Err(Error::Timeout {
                            elapsed: request.timeout.unwrap_or_default(),
                        });
                    }
                    let retryable = match &inner.config.should_retry {
                        Some(decide) => decide(&attempt, &err),
                        None => RetryPolicy::default_should_retry(&err),
                    };
                    if !retryable || retries >= policy.max_retries {
                        if retries > 0 {
                            self.dispatch(
                                names::RETRY_FAILED,
                                EventPayload::Error {
                                    request: Arc::clone(&request),
                                    error: Arc::new(err.clone()),
                                },
                            )
                            .await;
                        }
                        break Err(err);
                    }
                    retries += 1;
                    let delay = policy.backoff_delay(retries);
                    inner.metrics.record_retry();
                    self.dispatch(
                        names::RETRY_ATTEMPT,
                        EventPayload::Retry {
                            request: Arc::clone(&request),
                            attempt: retries,
                            delay,
                        },
                    )
                    .await;
                    tokio::select! {
                        biased;
                        _ = composed.cancelled() => {
                            break Err(self.abort_error(&request, record));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        };
        permit.release();

        match result {
            Ok(response) => {
                self.write_cache(&request, &response).await;
                if !request.meta.is_revalidation {
                    inner.metrics.record_success();
                    self.dispatch(
                        names::RESPONSE_SUCCESS,
                        EventPayload::Response {
                            request: Arc::clone(&request),
                            response: Arc::new(response.clone()),
                        },
                    )
                    .await;
                }
                Ok(response)
            }
            Err(err) => Err(err),
        }
    }

    /// One adapter attempt under the composed signal, with the attempt
    /// timeout armed separately from the internal controller.
    async fn run_attempt(
        &self,
        attempt: &Request,
        composed: &AbortSignal,
        record: &Arc<PendingRecord>,
        cache_key: Option<&CacheKey>,
    ) -> Result<Response, Error> {
        let inner = &self.inner;
        let started = Instant::now();
        let send = inner.adapter.send(attempt, composed.clone());

        // Biased order: a fired signal beats a simultaneously-due attempt
        // timer, so deadline attribution stays precise.
        let raw = if let Some(timeout) = attempt.timeout {
            tokio::select! {
                biased;
                raw = send => raw,
                _ = composed.cancelled() => {
                    return Err(self.abort_error(attempt, record));
                }
                _ = tokio::time::sleep(timeout) => {
                    return Err(Error::Timeout { elapsed: started.elapsed() });
                }
            }
        } else {
            tokio::select! {
                biased;
                raw = send => raw,
                _ = composed.cancelled() => {
                    return Err(self.abort_error(attempt, record));
                }
            }
        };
        let raw = raw.map_err(|err| self.classify(err, record, started.elapsed()))?;

        let duration = started.elapsed();
        let mut response =
            Response::from_attempt(attempt.id, raw.status, raw.headers, raw.body, duration);
        response.retry_count = attempt.retry_count;
        let response = inner.interceptors.run_response(response).await?;

        // A 304 on a conditional refetch materializes a success from the
        // cached body and restamps the entry.
        if response.status == StatusCode::NOT_MODIFIED && attempt.is_refetch() {
            if let Some(key) = cache_key {
                if let Some(entry) = inner.cache.peek(key) {
                    let refreshed =
                        inner
                            .policy
                            .refresh_entry(attempt, &entry, &response.headers, Utc::now());
                    inner.cache.insert(key.clone(), refreshed.clone());
                    self.dispatch(
                        names::CACHE_SET,
                        EventPayload::Cache {
                            key: key.clone(),
                            request: Some(record.request()),
                        },
                    )
                    .await;
                    let mut synthesized = response_from_entry(attempt.id, &refreshed);
                    synthesized.duration = duration;
                    synthesized.retry_count = attempt.retry_count;
                    return Ok(synthesized);
                }
            }
        }

        let valid = match attempt
            .validate_status
            .as_ref()
            .or(inner.config.validate_status.as_ref())
        {
            Some(validator) => validator(response.status),
            None => response.status.is_success(),
        };
        if !valid {
            return Err(Error::Http {
                status: response.status,
                response: Box::new(response),
            });
        }
        Ok(response)
    }

    /// Terminal error for an abort observed outside the adapter, with the
    /// first-fired source attributed.
    fn abort_error(&self, request: &Request, record: &Arc<PendingRecord>) -> Error {
        if let Some(reason) = record.controller.reason() {
            return match reason.origin {
                AbortOrigin::Timeout => Error::Timeout {
                    elapsed: request.timeout.unwrap_or_default(),
                },
                origin => Error::Canceled {
                    origin,
                    reason: reason.message,
                },
            };
        }
        if let Some(reason) = record.external.as_ref().and_then(AbortSignal::reason) {
            return Error::Canceled {
                origin: AbortOrigin::External,
                reason: reason.message,
            };
        }
        Error::AbortedWhileWaiting
    }

    /// Maps an adapter failure into the closed taxonomy, reclassifying to
    /// `Canceled` when the request's controller shows an abort — unless
    /// the abort was the deadline, which stays `Timeout`.
    fn classify(
        &self,
        err: AdapterError,
        record: &Arc<PendingRecord>,
        elapsed: Duration,
    ) -> Error {
        let internal = record.controller.reason();
        let external_fired = record
            .external
            .as_ref()
            .is_some_and(AbortSignal::is_aborted);
        match err {
            AdapterError::Aborted => match internal {
                Some(reason) if reason.origin == AbortOrigin::Timeout => {
                    Error::Timeout { elapsed }
                }
                Some(reason) => Error::Canceled {
                    origin: reason.origin,
                    reason: reason.message,
                },
                None => Error::Canceled {
                    origin: AbortOrigin::External,
                    reason: record
                        .external
                        .as_ref()
                        .and_then(AbortSignal::reason)
                        .and_then(|r| r.message),
                },
            },
            AdapterError::SendFailed { source } => Error::send_failed(source),
            AdapterError::Network { source } => match internal {
                Some(reason) if reason.origin == AbortOrigin::Timeout => {
                    Error::Timeout { elapsed }
                }
                Some(reason) => Error::Canceled {
                    origin: reason.origin,
                    reason: reason.message,
                },
                None if external_fired => Error::Canceled {
                    origin: AbortOrigin::External,
                    reason: None,
                },
                None => Error::network(source),
            },
        }
    }

    // ---------------------------------------------------------------------
    // Cache plumbing
    // ---------------------------------------------------------------------

    fn base_key(&self, request: &Request) -> CacheKey {
        CacheKey::fingerprint(&request.method, &request.url, request.params.as_ref(), &[])
    }

    /// Fingerprint used for the probe: the explicit key when given, else
    /// the recorded vary selection for this URL (default on first touch).
    fn probe_key(&self, request: &Request) -> CacheKey {
        if let Some(key) = &request.cache_key {
            return key.clone();
        }
        let base = self.base_key(request);
        let vary_names = self
            .inner
            .cache
            .vary_names(&base)
            .unwrap_or_else(|| Arc::new(HttpCachePolicy::default_vary()));
        HttpCachePolicy::fingerprint(request, &vary_names)
    }

    async fn write_cache(&self, request: &Arc<Request>, response: &Response) {
        let inner = &self.inner;
        if !inner.config.enable_cache || response.from_cache {
            return;
        }
        if !inner.policy.should_cache(request, response) {
            return;
        }
        let key = match &request.cache_key {
            Some(key) => key.clone(),
            None => {
                let vary_names = match HttpCachePolicy::response_vary(&response.headers) {
                    Some(declared) => Arc::new(declared),
                    None => Arc::new(HttpCachePolicy::default_vary()),
                };
                inner
                    .cache
                    .set_vary(self.base_key(request), Arc::clone(&vary_names));
                HttpCachePolicy::fingerprint(request, &vary_names)
            }
        };
        let entry = inner.policy.build_entry(request, response, Utc::now());
        inner.cache.insert(key.clone(), entry);
        self.dispatch(
            names::CACHE_SET,
            EventPayload::Cache {
                key,
                request: Some(Arc::clone(request)),
            },
        )
        .await;
    }

    /// Kicks off the deduplicated background refresh a stale hit asks
    /// for: a distinct request with a fresh id, forced refetch, no caller
    /// signal, and no retries.
    fn spawn_revalidation(&self, origin: &Arc<Request>, key: CacheKey) {
        let client = self.clone();
        let origin = Arc::clone(origin);
        let origin_url = origin.url.clone();
        let task_key = key.clone();
        let spawned = self.inner.offload.spawn_keyed(task_key, async move {
            let mut request = (*origin).clone();
            request.id = client.fresh_id();
            request.signal = None;
            request.retry = RetryOptions {
                max_retries: Some(0),
                delay: None,
                jitter: None,
            };
            request.retry_count = 0;
            request.cache.force_refresh = true;
            request.cache.ignore_cache = false;
            request.cache_key = Some(key);
            request.meta.is_revalidation = true;
            request.meta.created_at = Utc::now();
            if let Err(err) = client.execute(request).await {
                debug!(%err, "background revalidation failed");
            }
        });
        if !spawned {
            debug!(url = %origin_url, "revalidation already in flight");
        }
    }

    // ---------------------------------------------------------------------
    // Events
    // ---------------------------------------------------------------------

    /// Awaited emission so per-request event order stays total; chain
    /// failures are observability bugs and must not break the request
    /// path.
    async fn dispatch(&self, event: &'static str, payload: EventPayload) {
        if let Err(err) = self.inner.bus.emit_and_wait(event, payload).await {
            error!(%event, %err, "lifecycle emission failed");
        }
    }

    fn spawn_metrics_emitter(&self) {
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(METRICS_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(inner) = weak.upgrade() else { break };
                let snapshot = inner
                    .metrics
                    .snapshot(inner.cache.len(), &inner.queue.stats());
                if let Err(err) = inner
                    .bus
                    .emit_and_wait(names::METRICS_COLLECT, EventPayload::Metrics { snapshot })
                    .await
                {
                    warn!(%err, "metrics emission failed");
                }
            }
        });
        lock(&self.inner.cleanups).push(handle);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.inner.config)
            .field("in_flight", &self.inner.pending.len())
            .field("queue", &self.inner.queue)
            .finish_non_exhaustive()
    }
}

/// Synthesizes a caller-visible response from a cache entry.
fn response_from_entry(request_id: RequestId, entry: &courier_core::CacheEntry) -> Response {
    Response {
        request_id,
        status: entry.status,
        headers: entry.headers.clone(),
        body: entry.body.clone(),
        duration: Duration::ZERO,
        from_cache: true,
        cache_timestamp: Some(entry.timestamp),
        etag: entry.etag.clone(),
        last_modified: entry.last_modified.clone(),
        retry_count: 0,
    }
}

/// Joins the base URL and path, then appends serialized params.
fn resolve_url(
    base: Option<&str>,
    url: &str,
    params: Option<&Map<String, Value>>,
) -> Result<String, Error> {
    let mut full = if url.contains("://") || base.is_none() {
        url.to_owned()
    } else {
        let base = base.unwrap_or_default();
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            url.trim_start_matches('/')
        )
    };
    if let Some(params) = params {
        if !params.is_empty() {
            let query = serde_qs::to_string(params).map_err(|err| Error::Config {
                message: format!("params are not serializable as a query string: {err}"),
            })?;
            full.push(if full.contains('?') { '&' } else { '?' });
            full.push_str(&query);
        }
    }
    Ok(full)
}
