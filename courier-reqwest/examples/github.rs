//! Orchestrated GitHub API Client Example
//!
//! Demonstrates the request orchestrator over the reqwest adapter.
//!
//! Features shown:
//!   - Concurrency-limited dispatch through the request queue
//!   - Retries with exponential backoff and jitter
//!   - Client-side caching: first request misses, second one hits
//!   - Lifecycle observation through the typed event bus
//!
//! Run:
//!   cargo run -p courier-reqwest --example github
//!
//! What it does:
//!   - Fetches GitHub API data for the rust-lang/rust repository twice
//!   - First request: cache miss (fetches from GitHub)
//!   - Second request: cache hit (returns the cached body)

use std::time::Duration;

use courier::bus::handler_fn;
use courier::{Client, RetryPolicy};
use courier_reqwest::ReqwestAdapter;
use http::HeaderValue;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter("courier=debug")
        .init();

    let mut headers = http::HeaderMap::new();
    headers.insert("user-agent", HeaderValue::from_static("courier-example"));
    headers.insert(
        "accept",
        HeaderValue::from_static("application/vnd.github+json"),
    );

    let client = Client::builder()
        .adapter(ReqwestAdapter::new())
        .base_url("https://api.github.com")
        .default_headers(headers)
        .concurrent_requests(4)
        .retry(RetryPolicy {
            max_retries: 2,
            base_delay: Duration::from_millis(250),
            jitter: 0.3,
        })
        .default_cache_ttl(Duration::from_secs(60))
        .build()?;

    // Watch every cache event go by.
    client
        .bus()
        .on_pattern(
            "cache:*",
            handler_fn(|event, _payload| println!("event: {event}")),
        )
        .expect("valid pattern");

    let first = client.get("/repos/rust-lang/rust").await?;
    println!(
        "first:  status={} from_cache={} bytes={}",
        first.status,
        first.from_cache,
        first.body.len()
    );

    let second = client.get("/repos/rust-lang/rust").await?;
    println!(
        "second: status={} from_cache={} bytes={}",
        second.status,
        second.from_cache,
        second.body.len()
    );

    let metrics = client.metrics();
    println!(
        "requests={} cache hit/miss={}/{}",
        metrics.requests.total, metrics.cache.hit, metrics.cache.miss
    );

    client.destroy();
    Ok(())
}
