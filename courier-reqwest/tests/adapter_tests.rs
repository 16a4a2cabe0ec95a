//! Integration tests for ReqwestAdapter using wiremock.

use std::sync::Arc;
use std::time::Duration;

use courier::bus::handler_fn;
use courier::{Client, RetryPolicy};
use courier_core::{
    AbortController, AbortOrigin, AbortReason, Adapter, AdapterError, Request, RequestId,
};
use courier_reqwest::ReqwestAdapter;
use http::Method;
use std::sync::Mutex;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

#[tokio::test]
async fn single_attempt_round_trip() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/data"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "message": "hello"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let adapter = ReqwestAdapter::new();
    let request = Request::new(RequestId(1), Method::GET, format!("{}/data", server.uri()));
    let controller = AbortController::new();

    let response = adapter.send(&request, controller.signal()).await.unwrap();
    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_slice(&response.body).unwrap();
    assert_eq!(body["message"], "hello");
}

#[tokio::test]
async fn status_is_not_interpreted_by_the_adapter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/oops"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let adapter = ReqwestAdapter::new();
    let request = Request::new(RequestId(1), Method::GET, format!("{}/oops", server.uri()));
    let response = adapter
        .send(&request, AbortController::new().signal())
        .await
        .unwrap();
    assert_eq!(response.status, 503);
}

#[tokio::test]
async fn pre_aborted_signal_short_circuits() {
    let server = MockServer::start().await;
    let adapter = ReqwestAdapter::new();
    let request = Request::new(RequestId(1), Method::GET, format!("{}/data", server.uri()));

    let controller = AbortController::new();
    controller.abort(AbortReason::new(AbortOrigin::User));
    let err = adapter
        .send(&request, controller.signal())
        .await
        .unwrap_err();
    assert!(matches!(err, AdapterError::Aborted));
}

#[tokio::test]
async fn abort_during_send_is_distinguished_from_network_failure() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/slow"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(30)))
        .mount(&server)
        .await;

    let adapter = ReqwestAdapter::new();
    let request = Request::new(RequestId(1), Method::GET, format!("{}/slow", server.uri()));
    let controller = AbortController::new();
    let signal = controller.signal();

    let send = tokio::spawn(async move { adapter.send(&request, signal).await });
    tokio::time::sleep(Duration::from_millis(50)).await;
    controller.abort(AbortReason::new(AbortOrigin::User));

    let err = send.await.unwrap().unwrap_err();
    assert!(matches!(err, AdapterError::Aborted));
}

#[tokio::test]
async fn unreachable_host_is_a_network_error() {
    let adapter = ReqwestAdapter::new();
    // Reserved TEST-NET-1 address; nothing listens there.
    let request = Request::new(RequestId(1), Method::GET, "http://192.0.2.1:81/");
    let controller = AbortController::new();

    let send = adapter.send(&request, controller.signal());
    let err = tokio::time::timeout(Duration::from_secs(30), send)
        .await
        .ok()
        .map(|r| r.unwrap_err());
    if let Some(err) = err {
        assert!(matches!(err, AdapterError::Network { .. }));
    }
}

#[tokio::test]
async fn orchestrator_retries_through_the_adapter() {
    // Full-stack: 503 twice, then 200, through the Client.
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
        .mount(&server)
        .await;

    let client = Client::builder()
        .adapter(ReqwestAdapter::new())
        .base_url(server.uri())
        .retry(RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(10),
            jitter: 0.0,
        })
        .build()
        .unwrap();

    let response = client.get("/flaky").await.unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.retry_count, 2);
    assert_eq!(response.text(), "recovered");
}

#[tokio::test]
async fn default_headers_reach_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/hdr"))
        .and(header("x-api-key", "secret"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let mut headers = http::HeaderMap::new();
    headers.insert("x-api-key", "secret".parse().unwrap());

    let client = Client::builder()
        .adapter(ReqwestAdapter::new())
        .base_url(server.uri())
        .default_headers(headers)
        .build()
        .unwrap();

    client.get("/hdr").await.unwrap();
}

#[tokio::test]
async fn cache_round_trip_over_the_wire() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cached"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("payload")
                .insert_header("cache-control", "max-age=60"),
        )
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder()
        .adapter(ReqwestAdapter::new())
        .base_url(server.uri())
        .build()
        .unwrap();

    let hits = Arc::new(Mutex::new(0u32));
    let seen = Arc::clone(&hits);
    client.on(
        "cache:hit",
        handler_fn(move |_, _| *seen.lock().unwrap() += 1),
    );

    let first = client.get("/cached").await.unwrap();
    assert!(!first.from_cache);
    let second = client.get("/cached").await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.body, first.body);
    assert_eq!(*hits.lock().unwrap(), 1);
}
