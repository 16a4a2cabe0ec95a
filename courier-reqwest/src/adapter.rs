//! The reqwest-backed adapter.

use async_trait::async_trait;

use courier_core::{Adapter, AdapterError, AdapterResponse, AbortSignal, Request};

/// Transport adapter executing single attempts over a shared
/// [`reqwest::Client`].
#[derive(Debug, Clone, Default)]
pub struct ReqwestAdapter {
    client: reqwest::Client,
}

impl ReqwestAdapter {
    /// An adapter over a default `reqwest::Client`.
    pub fn new() -> Self {
        Self::default()
    }

    /// An adapter over a caller-configured client (pools, proxies, TLS).
    pub fn with_client(client: reqwest::Client) -> Self {
        ReqwestAdapter { client }
    }
}

#[async_trait]
impl Adapter for ReqwestAdapter {
    async fn send(
        &self,
        request: &Request,
        signal: AbortSignal,
    ) -> Result<AdapterResponse, AdapterError> {
        if signal.is_aborted() {
            return Err(AdapterError::Aborted);
        }

        let mut builder = self
            .client
            .request(request.method.clone(), &request.url)
            .headers(request.headers.clone());
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }

        let attempt = async {
            let response = builder.send().await.map_err(classify)?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await.map_err(classify)?;
            Ok(AdapterResponse {
                status,
                headers,
                body,
            })
        };

        tokio::select! {
            result = attempt => result,
            _ = signal.cancelled() => Err(AdapterError::Aborted),
        }
    }
}

/// Maps reqwest failures onto the adapter taxonomy: request-construction
/// problems are pre-flight send failures, everything else below the HTTP
/// layer (DNS, TCP, TLS, body reads) is a network error.
fn classify(err: reqwest::Error) -> AdapterError {
    if err.is_builder() {
        AdapterError::SendFailed {
            source: Box::new(err),
        }
    } else {
        AdapterError::Network {
            source: Box::new(err),
        }
    }
}
