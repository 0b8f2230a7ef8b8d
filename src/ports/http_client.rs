use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for upstream HTTP operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when connection to backend fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when request times out
    #[error("Timeout error after {0} seconds")]
    Timeout(u64),

    /// Error when request is invalid
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for upstream HTTP operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for dispatching requests to
/// backends and probing their health.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Forward an HTTP request to a backend server, streaming the response
    /// body back.
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;

    /// Issue a single `GET /` probe against `url` and return the status
    /// code. A transport failure is an error; any response at all, whatever
    /// the status, is a successful probe.
    async fn probe(&self, url: &str, timeout_secs: u64) -> HttpClientResult<u16>;
}
