//! End-to-end orchestrator scenarios against a scripted mock adapter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode};

use courier::bus::handler_fn;
use courier::{Client, ClientBuilder, EventPayload, RequestOptions, RetryPolicy};
use courier_core::{
    AbortController, AbortOrigin, Adapter, AdapterError, AdapterResponse, AbortSignal, CacheOptions,
    Error, Request, RequestId,
};

// ---------------------------------------------------------------------------
// Mock adapter
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Step {
    Reply {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        body: &'static str,
    },
    DelayedReply {
        delay: Duration,
        status: u16,
    },
    NetworkFailure,
}

impl Step {
    fn ok(body: &'static str) -> Self {
        Step::Reply {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    fn status(status: u16) -> Self {
        Step::Reply {
            status,
            headers: Vec::new(),
            body: "",
        }
    }
}

struct MockAdapter {
    script: Mutex<VecDeque<Step>>,
    requests: Mutex<Vec<Request>>,
    calls: AtomicUsize,
}

impl MockAdapter {
    fn scripted(steps: impl IntoIterator<Item = Step>) -> Arc<Self> {
        Arc::new(MockAdapter {
            script: Mutex::new(steps.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn request_header(&self, call: usize, name: &str) -> Option<String> {
        let requests = self.requests.lock().unwrap();
        requests.get(call).and_then(|request| {
            request
                .headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned)
        })
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn send(
        &self,
        request: &Request,
        signal: AbortSignal,
    ) -> Result<AdapterResponse, AdapterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::ok("fallback"));
        match step {
            Step::Reply {
                status,
                headers,
                body,
            } => Ok(reply(status, &headers, body)),
            Step::DelayedReply { delay, status } => {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => Ok(reply(status, &[], "late")),
                    _ = signal.cancelled() => Err(AdapterError::Aborted),
                }
            }
            Step::NetworkFailure => Err(AdapterError::Network {
                source: "connection reset by peer".into(),
            }),
        }
    }
}

fn reply(status: u16, headers: &[(&str, &str)], body: &'static str) -> AdapterResponse {
    let mut header_map = HeaderMap::new();
    for (name, value) in headers {
        header_map.append(
            HeaderName::from_bytes(name.as_bytes()).unwrap(),
            HeaderValue::from_str(value).unwrap(),
        );
    }
    AdapterResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: header_map,
        body: Bytes::from_static(body.as_bytes()),
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn builder(adapter: &Arc<MockAdapter>) -> ClientBuilder<Arc<dyn Adapter>> {
    Client::builder()
        .adapter(Arc::clone(adapter))
        .base_url("https://api.test")
        .retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            jitter: 0.0,
        })
}

type EventLog = Arc<Mutex<Vec<(String, Option<u64>)>>>;

fn record_events(client: &Client) -> EventLog {
    let log: EventLog = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    client
        .bus()
        .on_pattern(
            "*",
            handler_fn(move |event, payload: &EventPayload| {
                let id = payload.request().map(|r| r.id.0);
                sink.lock().unwrap().push((event.to_string(), id));
            }),
        )
        .unwrap();
    log
}

fn events_for(log: &EventLog, id: u64) -> Vec<String> {
    log.lock()
        .unwrap()
        .iter()
        .filter(|(_, event_id)| *event_id == Some(id))
        .map(|(name, _)| name.clone())
        .collect()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition should hold within five seconds");
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[tokio::test]
async fn success_emits_the_full_ordered_lifecycle() {
    let adapter = MockAdapter::scripted([Step::ok("hello")]);
    let client = builder(&adapter).build().unwrap();
    let log = record_events(&client);

    let response = client.get("/hello").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.text(), "hello");
    assert!(!response.from_cache);

    assert_eq!(
        events_for(&log, 1),
        vec![
            "cache:miss",
            "request:start",
            "cache:set",
            "response:success",
            "request:end",
        ]
    );
}

#[tokio::test]
async fn retry_on_503_twice_then_success() {
    let adapter = MockAdapter::scripted([Step::status(503), Step::status(503), Step::ok("done")]);
    let client = builder(&adapter).build().unwrap();

    let attempts: Arc<Mutex<Vec<u32>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&attempts);
    client.on(
        "retry:attempt",
        handler_fn(move |_, payload: &EventPayload| {
            if let EventPayload::Retry { attempt, .. } = payload {
                sink.lock().unwrap().push(*attempt);
            }
        }),
    );

    let response = client.get("/flaky").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.retry_count, 2);
    assert_eq!(adapter.calls(), 3);
    assert_eq!(*attempts.lock().unwrap(), vec![1, 2]);
    assert_eq!(client.metrics().requests.retry, 2);
}

#[tokio::test]
async fn exhausted_retries_emit_retry_failed() {
    let adapter = MockAdapter::scripted([
        Step::status(503),
        Step::status(503),
        Step::status(503),
        Step::status(503),
    ]);
    let client = builder(&adapter).build().unwrap();
    let log = record_events(&client);

    let err = client.get("/always-broken").await.unwrap_err();
    assert_eq!(err.code(), "HTTP_503");
    assert_eq!(adapter.calls(), 4);

    let events = events_for(&log, 1);
    assert!(events.contains(&"retry:failed".to_owned()));
    assert_eq!(events.last().unwrap(), "request:end");
}

#[tokio::test]
async fn non_retryable_status_fails_without_retry() {
    let adapter = MockAdapter::scripted([Step::status(404)]);
    let client = builder(&adapter).build().unwrap();

    let err = client.get("/missing").await.unwrap_err();
    match err {
        Error::Http { status, response } => {
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(response.status, StatusCode::NOT_FOUND);
        }
        other => panic!("expected Http error, got {other:?}"),
    }
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn timeout_is_honored_and_the_permit_is_released() {
    let adapter = MockAdapter::scripted([
        Step::DelayedReply {
            delay: Duration::from_secs(3),
            status: 200,
        },
        Step::ok("next"),
    ]);
    let client = builder(&adapter).concurrent_requests(1).build().unwrap();
    let log = record_events(&client);

    let options = RequestOptions {
        timeout: Some(Duration::from_millis(150)),
        ..RequestOptions::get("/slow")
    };
    let err = client.request(options).await.unwrap_err();
    assert!(err.is_timeout());

    let events = events_for(&log, 1);
    let timeout_at = events.iter().position(|e| e == "timeout").unwrap();
    let error_at = events.iter().position(|e| e == "response:error").unwrap();
    let end_at = events.iter().position(|e| e == "request:end").unwrap();
    assert!(timeout_at < error_at && error_at < end_at);

    // The permit came back: the next request on the capacity-1 queue
    // admits and completes.
    let response = client.get("/after").await.unwrap();
    assert_eq!(response.text(), "next");
    assert_eq!(client.metrics().requests.timeout, 1);
}

#[tokio::test]
async fn cancel_before_start_never_starts() {
    let adapter = MockAdapter::scripted([
        Step::DelayedReply {
            delay: Duration::from_secs(3),
            status: 200,
        },
        Step::ok("unreached"),
    ]);
    let client = builder(&adapter)
        .concurrent_requests(1)
        .enable_cache(false)
        .build()
        .unwrap();
    let log = record_events(&client);

    let background = client.clone();
    let first = tokio::spawn(async move { background.get("/long").await });
    wait_until(|| adapter.calls() == 1).await;

    let waiting = client.clone();
    let second = tokio::spawn(async move { waiting.get("/queued").await });
    wait_until({
        let client = client.clone();
        move || client.queue_stats().pending == 1
    })
    .await;

    assert!(client.cancel(RequestId(2), Some("changed my mind")));
    let err = second.await.unwrap().unwrap_err();
    match err {
        Error::Canceled { origin, reason } => {
            assert_eq!(origin, AbortOrigin::User);
            assert_eq!(reason.as_deref(), Some("changed my mind"));
        }
        other => panic!("expected Canceled, got {other:?}"),
    }

    let events = events_for(&log, 2);
    assert_eq!(events, vec!["request:canceled", "request:end"]);
    // The canceled request never consumed the slot.
    assert_eq!(client.queue_stats().active, 1);
    assert_eq!(adapter.calls(), 1);

    client.cancel(RequestId(1), None);
    let _ = first.await.unwrap();
}

#[tokio::test]
async fn cancel_is_idempotent() {
    let adapter = MockAdapter::scripted([Step::DelayedReply {
        delay: Duration::from_secs(3),
        status: 200,
    }]);
    let client = builder(&adapter).build().unwrap();
    let log = record_events(&client);

    let background = client.clone();
    let pending = tokio::spawn(async move { background.get("/long").await });
    wait_until(|| adapter.calls() == 1).await;

    assert!(client.cancel(RequestId(1), None));
    assert!(!client.cancel(RequestId(1), None));

    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_canceled());
    // Terminal outcome removes the record; further cancels are inert.
    assert!(!client.cancel(RequestId(1), None));

    let canceled_events: Vec<_> = events_for(&log, 1)
        .into_iter()
        .filter(|e| e == "request:canceled")
        .collect();
    assert_eq!(canceled_events.len(), 1);
}

#[tokio::test]
async fn external_signal_cancels_with_external_attribution() {
    let adapter = MockAdapter::scripted([Step::DelayedReply {
        delay: Duration::from_secs(3),
        status: 200,
    }]);
    let client = builder(&adapter).build().unwrap();

    let controller = AbortController::new();
    let options = RequestOptions {
        signal: Some(controller.signal()),
        ..RequestOptions::get("/long")
    };
    let background = client.clone();
    let pending = tokio::spawn(async move { background.request(options).await });
    wait_until(|| adapter.calls() == 1).await;

    controller.abort(courier_core::AbortReason::new(AbortOrigin::External));
    let err = pending.await.unwrap().unwrap_err();
    match err {
        Error::Canceled { origin, .. } => assert_eq!(origin, AbortOrigin::External),
        other => panic!("expected Canceled, got {other:?}"),
    }
}

#[tokio::test]
async fn network_errors_emit_connection_error_and_retry() {
    let adapter = MockAdapter::scripted([Step::NetworkFailure, Step::ok("recovered")]);
    let client = builder(&adapter).build().unwrap();

    let response = client.get("/wobbly").await.unwrap();
    assert_eq!(response.text(), "recovered");
    assert_eq!(response.retry_count, 1);

    let adapter = MockAdapter::scripted([
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::NetworkFailure,
    ]);
    let client = builder(&adapter).build().unwrap();
    let log = record_events(&client);
    let err = client.get("/dead").await.unwrap_err();
    assert_eq!(err.code(), "NETWORK_ERROR");
    let events = events_for(&log, 1);
    assert!(events.contains(&"connection:error".to_owned()));
    assert!(events.contains(&"response:error".to_owned()));
}

#[tokio::test]
async fn cache_round_trip_within_ttl() {
    let adapter = MockAdapter::scripted([Step::Reply {
        status: 200,
        headers: vec![("cache-control", "max-age=60")],
        body: "payload",
    }]);
    let client = builder(&adapter).build().unwrap();
    let log = record_events(&client);

    let first = client.get("/cached").await.unwrap();
    assert!(!first.from_cache);

    let second = client.get("/cached").await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert!(second.cache_timestamp.is_some());
    assert_eq!(adapter.calls(), 1);
    assert_eq!(client.cache_stats().hits, 1);
    assert_eq!(client.metrics().cache.hit, 1);

    // The hit short-circuits: no start, no adapter touch, but still a
    // terminal end.
    assert_eq!(events_for(&log, 2), vec!["cache:hit", "request:end"]);
}

#[tokio::test]
async fn ignore_cache_bypasses_the_probe() {
    let adapter = MockAdapter::scripted([Step::ok("one"), Step::ok("two")]);
    let client = builder(&adapter).build().unwrap();

    let _ = client.get("/thing").await.unwrap();
    let options = RequestOptions {
        cache: CacheOptions {
            ignore_cache: true,
            ..CacheOptions::default()
        },
        ..RequestOptions::get("/thing")
    };
    let second = client.request(options).await.unwrap();
    assert!(!second.from_cache);
    assert_eq!(second.text(), "two");
    assert_eq!(adapter.calls(), 2);
}

#[tokio::test]
async fn post_responses_are_not_cached() {
    let adapter = MockAdapter::scripted([Step::ok("created"), Step::ok("created-again")]);
    let client = builder(&adapter).build().unwrap();

    let _ = client.post("/items", "{}").await.unwrap();
    let second = client.post("/items", "{}").await.unwrap();
    assert!(!second.from_cache);
    assert_eq!(adapter.calls(), 2);
    assert_eq!(client.cache_stats().entries, 0);
}

#[tokio::test]
async fn stale_hit_serves_and_revalidates_conditionally() {
    let adapter = MockAdapter::scripted([
        Step::Reply {
            status: 200,
            headers: vec![
                ("etag", "\"v1\""),
                ("cache-control", "max-age=0, stale-while-revalidate=60"),
            ],
            body: "payload-v1",
        },
        Step::Reply {
            status: 304,
            headers: vec![("etag", "\"v1\"")],
            body: "",
        },
    ]);
    let client = builder(&adapter)
        .enable_conditional_requests(true)
        .build()
        .unwrap();
    let log = record_events(&client);

    let first = client.get("/doc").await.unwrap();
    assert!(!first.from_cache);
    let written = client.cache_stats();
    assert_eq!(written.entries, 1);

    // Within the stale window: served from cache immediately, refreshed
    // in the background with a conditional request.
    let second = client.get("/doc").await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.text(), "payload-v1");
    let stale_timestamp = second.cache_timestamp.unwrap();

    wait_until(|| adapter.calls() == 2).await;
    assert_eq!(
        adapter.request_header(1, "if-none-match").as_deref(),
        Some("\"v1\"")
    );

    // The 304 restamped the entry: a later stale read observes a newer
    // write timestamp.
    wait_until({
        let client = client.clone();
        move || {
            client.cache_stats().stale_hits >= 1 && client.in_flight() == 0
        }
    })
    .await;
    let third = client.get("/doc").await.unwrap();
    assert!(third.from_cache);
    assert!(third.cache_timestamp.unwrap() >= stale_timestamp);

    let events = events_for(&log, 2);
    assert_eq!(events, vec!["cache:stale", "request:end"]);
    // The background revalidation (id 3) has no user-visible lifecycle.
    let reval_events = events_for(&log, 3);
    assert!(!reval_events.contains(&"request:start".to_owned()));
    assert!(!reval_events.contains(&"request:end".to_owned()));
}

#[tokio::test]
async fn stale_revalidation_can_be_disabled() {
    let adapter = MockAdapter::scripted([Step::Reply {
        status: 200,
        headers: vec![("cache-control", "max-age=0, stale-while-revalidate=60")],
        body: "stale-ok",
    }]);
    let client = builder(&adapter).build().unwrap();

    let _ = client.get("/doc").await.unwrap();
    let options = RequestOptions {
        cache: CacheOptions {
            revalidate_on_stale: Some(false),
            ..CacheOptions::default()
        },
        ..RequestOptions::get("/doc")
    };
    let second = client.request(options).await.unwrap();
    assert!(second.from_cache);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(adapter.calls(), 1);
}

#[tokio::test]
async fn custom_validate_status_accepts_other_codes() {
    let adapter = MockAdapter::scripted([Step::status(404)]);
    let client = builder(&adapter).build().unwrap();

    let options = RequestOptions {
        validate_status: Some(Arc::new(|status: StatusCode| status.as_u16() < 500)),
        ..RequestOptions::get("/absent")
    };
    let response = client.request(options).await.unwrap();
    assert_eq!(response.status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn interceptors_shape_what_the_adapter_sees() {
    use courier::Interceptor;

    struct AuthStamper;

    #[async_trait]
    impl Interceptor for AuthStamper {
        async fn on_request(&self, mut request: Request) -> Result<Request, Error> {
            request
                .headers
                .insert("x-auth", HeaderValue::from_static("token-1"));
            Ok(request)
        }
    }

    let adapter = MockAdapter::scripted([Step::ok("ok")]);
    let client = builder(&adapter).build().unwrap();
    client.add_interceptor(Arc::new(AuthStamper));

    client.get("/secured").await.unwrap();
    assert_eq!(
        adapter.request_header(0, "x-auth").as_deref(),
        Some("token-1")
    );
}

#[tokio::test]
async fn destroy_cancels_everything_and_rejects_new_work() {
    let adapter = MockAdapter::scripted([Step::DelayedReply {
        delay: Duration::from_secs(3),
        status: 200,
    }]);
    let client = builder(&adapter).build().unwrap();

    let background = client.clone();
    let pending = tokio::spawn(async move { background.get("/long").await });
    wait_until(|| adapter.calls() == 1).await;

    client.destroy();
    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_canceled());

    let err = client.get("/more").await.unwrap_err();
    assert!(matches!(err, Error::QueueClosed { .. }));
    assert_eq!(client.cache_stats().entries, 0);
}

#[tokio::test]
async fn end_is_emitted_exactly_once_per_request() {
    let adapter = MockAdapter::scripted([
        Step::status(503),
        Step::ok("eventually"),
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::NetworkFailure,
        Step::NetworkFailure,
    ]);
    let client = builder(&adapter).build().unwrap();
    let log = record_events(&client);

    let _ = client.get("/a").await;
    let _ = client.get("/b").await;

    for id in [1u64, 2] {
        let events = events_for(&log, id);
        let ends = events.iter().filter(|e| *e == "request:end").count();
        assert_eq!(ends, 1, "request {id} should end exactly once");
        let terminals = events
            .iter()
            .filter(|e| {
                ["response:success", "response:error", "request:canceled"].contains(&e.as_str())
            })
            .count();
        assert_eq!(terminals, 1, "request {id} should have one terminal event");
        assert_eq!(events.last().unwrap(), "request:end");
    }
}

#[tokio::test]
async fn metrics_snapshot_reflects_traffic() {
    let adapter = MockAdapter::scripted([
        Step::ok("one"),
        Step::status(503),
        Step::ok("two-after-retry"),
    ]);
    let client = builder(&adapter).build().unwrap();

    client.get("/m1").await.unwrap();
    client.get("/m2").await.unwrap();

    let snapshot = client.metrics();
    assert_eq!(snapshot.requests.total, 2);
    assert_eq!(snapshot.requests.success, 2);
    assert_eq!(snapshot.requests.active, 0);
    assert_eq!(snapshot.requests.retry, 1);
    assert_eq!(snapshot.cache.miss, 2);

    client.reset_metrics();
    assert_eq!(client.metrics().requests.total, 0);
}
