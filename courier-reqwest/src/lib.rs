#![warn(missing_docs)]
//! # courier-reqwest
//!
//! Reqwest-backed transport adapter for the Courier request orchestrator.
//!
//! [`ReqwestAdapter`] implements [`courier_core::Adapter`]: it executes
//! exactly one HTTP attempt per call, honors the composed cancellation
//! signal, and keeps cancellation distinguishable from network failure in
//! the errors it raises. Retries, caching, and validation stay with the
//! orchestrator.
//!
//! ```no_run
//! use courier_reqwest::ReqwestAdapter;
//!
//! # async fn example() -> Result<(), courier_core::Error> {
//! let client = courier::Client::builder()
//!     .adapter(ReqwestAdapter::new())
//!     .base_url("https://api.example.com")
//!     .build()?;
//! # Ok(())
//! # }
//! ```

mod adapter;

pub use adapter::ReqwestAdapter;
