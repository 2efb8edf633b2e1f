use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder, Response, Url};
use std::time::Duration;

use crate::error::BrokerError;

/// Shared HTTP client for identity provider and Teams calls.
/// No retries: a failed call surfaces to the request handler as-is.
#[derive(Clone)]
pub struct BrokerHttpClient {
    /// Shared HTTP client with connection pooling
    client: Client,
}

impl BrokerHttpClient {
    /// Create a new HTTP client
    pub fn new(connect_timeout: u64, request_timeout: u64) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout))
            .timeout(Duration::from_secs(request_timeout))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self { client })
    }

    /// Send a request and return the response whatever its status.
    /// Only transport failures become errors here; status handling is up to
    /// the caller, which knows whether a rejection is an exchange or upstream
    /// failure.
    pub async fn send(&self, request: RequestBuilder) -> Result<Response, BrokerError> {
        let request = request
            .build()
            .context("Failed to build HTTP request")?;
        let method = request.method().clone();
        let url = request.url().clone();

        tracing::debug!(method = %method, url = %url, "Sending HTTP request");

        match self.client.execute(request).await {
            Ok(response) => {
                tracing::debug!(status = %response.status(), url = %url, "Received HTTP response");
                Ok(response)
            }
            Err(e) => {
                // Categorize the error for better debugging
                let error_kind = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connection_failed"
                } else if e.is_request() {
                    "request_error"
                } else if e.is_body() {
                    "body_error"
                } else if e.is_decode() {
                    "decode_error"
                } else {
                    "unknown"
                };

                tracing::warn!(
                    error_kind = error_kind,
                    error = %e,
                    url = %url,
                    "HTTP request error"
                );

                Err(anyhow::anyhow!(
                    "HTTP request to {} failed: {} (kind: {})",
                    url.path(),
                    e,
                    error_kind
                )
                .into())
            }
        }
    }

    /// Get the underlying HTTP client
    pub fn client(&self) -> &Client {
        &self.client
    }
}

/// Append `segments` to the path of `base`, percent-encoding each one.
///
/// A segment can never change the path shape: `/`, `?` and `#` inside it
/// are encoded, and a bare `.` or `..` is refused.
pub fn endpoint_url(base: &str, segments: &[&str]) -> Result<Url, BrokerError> {
    if let Some(segment) = segments.iter().find(|s| matches!(**s, "." | "..")) {
        return Err(BrokerError::BadRequest(format!(
            "Invalid path segment: {}",
            segment
        )));
    }

    let mut url = Url::parse(base).with_context(|| format!("Invalid base URL: {}", base))?;
    url.path_segments_mut()
        .map_err(|_| anyhow::anyhow!("Base URL cannot carry a path: {}", base))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}
