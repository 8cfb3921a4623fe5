use async_trait::async_trait;
use axum::body::Body as AxumBody;
use hyper::{Request, Response};
use thiserror::Error;

/// Custom error type for outbound HTTP client operations
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum HttpClientError {
    /// Error when the connection to an upstream fails
    #[error("Connection error: {0}")]
    ConnectionError(String),

    /// Error when the request cannot be constructed or sent as-is
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Result type alias for HTTP client operations
pub type HttpClientResult<T> = Result<T, HttpClientError>;

/// HttpClient defines the port (interface) for making HTTP requests to
/// upstream services. Attempt deadlines and cancellation are the caller's
/// responsibility; the adapter only performs the exchange.
#[async_trait]
pub trait HttpClient: Send + Sync + 'static {
    /// Send an HTTP request to an upstream server
    ///
    /// # Arguments
    /// * `req` - The HTTP request to send to the upstream
    ///
    /// # Returns
    /// A future that resolves to the upstream's response or an error
    async fn send_request(&self, req: Request<AxumBody>) -> HttpClientResult<Response<AxumBody>>;
}
