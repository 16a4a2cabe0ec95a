#![warn(missing_docs)]
//! # courier-core
//!
//! Core traits and types for the Courier request orchestrator.
//!
//! This crate provides the foundational abstractions that keep Courier
//! **transport-agnostic**: the logical request/response model, cache
//! fingerprints and entry values, cancellation primitives with composed
//! attribution, the closed error taxonomy, and the [`Adapter`] contract
//! that concrete transports (like `courier-reqwest`) implement.
//!
//! The orchestrator itself — queue, cache store, event bus, interceptors,
//! retry, and the client façade — lives in the `courier` crate.

pub mod adapter;
pub mod entry;
pub mod error;
pub mod key;
pub mod request;
pub mod response;
pub mod signal;

pub use adapter::{Adapter, AdapterResponse};
pub use entry::{CacheEntry, Freshness};
pub use error::{AdapterError, BoxError, Error, SharedError};
pub use key::{CacheKey, DEFAULT_VARY_HEADERS};
pub use request::{
    CacheOptions, Request, RequestId, RequestMeta, RetryOptions, StatusValidator,
};
pub use response::Response;
pub use signal::{AbortController, AbortOrigin, AbortReason, AbortSignal};
