#![warn(missing_docs)]
//! # courier
//!
//! Client-side HTTP request orchestrator.
//!
//! Courier wraps a pluggable transport adapter with the machinery real
//! clients need: a bounded FIFO request queue, retries with exponential
//! backoff and jitter, composed cancellation (user + deadline + external
//! signal) with precise attribution, an in-memory cache with
//! stale-while-revalidate and conditional revalidation, an interceptor
//! pipeline, a typed event bus for lifecycle observability, and a metrics
//! collector.
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier::{Client, RequestOptions};
//! use courier::bus::handler_fn;
//!
//! # async fn example(adapter: impl courier_core::Adapter + 'static) -> Result<(), courier_core::Error> {
//! let client = Client::builder()
//!     .adapter(adapter)
//!     .base_url("https://api.example.com")
//!     .concurrent_requests(8)
//!     .build()?;
//!
//! client.on("request:end", handler_fn(|event, _payload| {
//!     println!("finished: {event}");
//! }));
//!
//! let response = client.get("/users/42").await?;
//! println!("{}", response.text());
//! # Ok(())
//! # }
//! ```

pub mod bus;
pub mod cache;
pub mod client;
pub mod config;
pub mod events;
pub mod interceptor;
pub mod metrics;
pub mod offload;
pub mod queue;
pub mod retry;

pub use client::{Client, ClientBuilder, NotSet, RequestOptions};
pub use config::ClientConfig;
pub use events::{EventPayload, names as event_names};
pub use interceptor::{Interceptor, InterceptorId};
pub use metrics::MetricsSnapshot;
pub use queue::{Permit, QueueError, QueueStats, RequestQueue};
pub use retry::RetryPolicy;

pub use courier_core::{
    AbortController, AbortOrigin, AbortReason, AbortSignal, Adapter, AdapterError,
    AdapterResponse, CacheEntry, CacheKey, CacheOptions, Error, Request, RequestId, Response,
    RetryOptions,
};

/// The `courier` prelude.
///
/// ```rust
/// use courier::prelude::*;
/// ```
pub mod prelude {
    pub use crate::bus::handler_fn;
    pub use crate::{Client, Error, RequestOptions, Response};
    pub use courier_core::{Adapter, AdapterResponse, AbortController, AbortSignal};
}
