//! Transport adapter contract.
//!
//! An [`Adapter`] executes exactly one HTTP attempt. The orchestrator owns
//! retries, caching, and classification; the adapter owns the wire. Two
//! obligations matter:
//!
//! - honor the [`AbortSignal`]: an attempt whose signal fires must stop
//!   and raise [`AdapterError::Aborted`], never a network failure;
//! - never mutate the request.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, StatusCode};

use crate::error::AdapterError;
use crate::request::Request;
use crate::signal::AbortSignal;

/// Raw result of one attempt, before validation.
///
/// Status is not interpreted here: a `503` is a successful *send* whose
/// classification belongs to the orchestrator.
#[derive(Debug, Clone)]
pub struct AdapterResponse {
    /// HTTP status as received.
    pub status: StatusCode,
    /// Response headers as received.
    pub headers: HeaderMap,
    /// Fully read body.
    pub body: Bytes,
}

/// A pluggable transport executing single HTTP attempts.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Executes one attempt under the composed cancellation signal.
    async fn send(
        &self,
        request: &Request,
        signal: AbortSignal,
    ) -> Result<AdapterResponse, AdapterError>;
}

#[async_trait]
impl<T> Adapter for Arc<T>
where
    T: Adapter + ?Sized,
{
    async fn send(
        &self,
        request: &Request,
        signal: AbortSignal,
    ) -> Result<AdapterResponse, AdapterError> {
        (**self).send(request, signal).await
    }
}
