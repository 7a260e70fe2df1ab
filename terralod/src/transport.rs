//! HTTP transport abstraction for testability.
//!
//! The pipeline never talks to `reqwest` directly; it goes through the
//! [`Transport`] trait so tests can substitute deterministic mock
//! transports, and so hosts with their own network stack (download
//! managers, request coalescing, offline caches) can plug it in underneath
//! the tile pipeline.
//!
//! A non-2xx status is *not* a transport error: the pipeline inspects the
//! status itself because 401 responses feed the token-refresh retry
//! protocol.

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;
use thiserror::Error;

/// Boxed future type for dyn-compatible async methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Errors that can occur before an HTTP response is available.
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    /// The request could not be issued or the connection failed.
    #[error("request to {url} failed: {reason}")]
    RequestFailed { url: String, reason: String },

    /// The transport could not be constructed.
    #[error("failed to create HTTP client: {0}")]
    ClientCreation(String),
}

/// A completed HTTP response.
#[derive(Debug, Clone)]
pub struct Response {
    /// HTTP status code.
    pub status: u16,

    /// The `Content-Type` header, verbatim, if present.
    pub content_type: Option<String>,

    /// The response body.
    pub body: Bytes,
}

impl Response {
    /// Returns true if the status is in `[200, 300)`.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Trait for issuing HTTP GET requests.
///
/// Implementations must be cheap to call from any thread; the returned
/// future may be driven on whatever executor the task processor provides.
pub trait Transport: Send + Sync {
    /// Issues a GET request with the given headers.
    ///
    /// # Arguments
    ///
    /// * `url` - The URL to request
    /// * `headers` - `(name, value)` pairs added to the request
    fn request(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> BoxFuture<'static, Result<Response, TransportError>>;
}

/// Real transport implementation using reqwest.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Creates a transport with default configuration.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .map_err(|e| TransportError::ClientCreation(e.to_string()))?;

        Ok(Self { client })
    }

    /// Creates a transport with a custom request timeout.
    pub fn with_timeout(timeout_secs: u64) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| TransportError::ClientCreation(e.to_string()))?;

        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn request(
        &self,
        url: &str,
        headers: &[(String, String)],
    ) -> BoxFuture<'static, Result<Response, TransportError>> {
        let client = self.client.clone();
        let url = url.to_string();
        let headers = headers.to_vec();

        Box::pin(async move {
            let mut request = client.get(&url);
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }

            let response = request.send().await.map_err(|e| TransportError::RequestFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;

            let status = response.status().as_u16();
            let content_type = response
                .headers()
                .get(reqwest::header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_owned);

            let body = response.bytes().await.map_err(|e| TransportError::RequestFailed {
                url: url.clone(),
                reason: format!("failed to read response body: {}", e),
            })?;

            Ok(Response {
                status,
                content_type,
                body,
            })
        })
    }
}
