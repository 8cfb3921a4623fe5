use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use eyre::Result;
use hyper::{Request, Response, Version, header, header::HeaderValue};
use hyper_rustls::HttpsConnector;
use hyper_util::{
    client::legacy::{Client, connect::HttpConnector},
    rt::TokioExecutor,
};
use rustls_native_certs::load_native_certs;

use crate::ports::http_client::{HttpClient, HttpClientError, HttpClientResult};

const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// HTTP client adapter using Hyper with Rustls (HTTP/1.1 + HTTP/2).
///
/// Responsibilities:
/// * Maintains the shared connection pool for all upstream calls
/// * Sets the `Host` header from the target URL
/// * Forces the request version to HTTP/1.1 while allowing ALPN to negotiate h2
/// * Converts between Hyper body and Axum body types
///
/// This adapter is intentionally minimal; timeouts, retries and circuit
/// breaking are layered on by the upstream call machinery.
pub struct HttpClientAdapter {
    client: Client<HttpsConnector<HttpConnector>, AxumBody>,
}

impl HttpClientAdapter {
    /// Create a new HTTP client adapter.
    pub fn new() -> Result<Self> {
        // Install default crypto provider for rustls if not already set
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

        let mut http_connector = HttpConnector::new();
        http_connector.enforce_http(false); // Allow HTTPS URLs

        let mut root_cert_store = rustls::RootCertStore::empty();
        let native_certs = load_native_certs();

        if !native_certs.certs.is_empty() {
            for cert in native_certs.certs {
                if root_cert_store.add(cert).is_err() {
                    tracing::warn!("Failed to add native certificate to rustls RootCertStore");
                }
            }
            tracing::info!("Loaded {} native root certificates.", root_cert_store.len());
        }

        if !native_certs.errors.is_empty() {
            tracing::warn!(
                "Some native certificates failed to load: {:?}",
                native_certs.errors
            );
        }

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(root_cert_store)
            .with_no_client_auth();

        // HTTPS connector with ALPN so HTTP/2 is preferred when upstreams
        // support it.
        let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_tls_config(tls_config)
            .https_or_http()
            .enable_all_versions()
            .wrap_connector(http_connector);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
            .pool_idle_timeout(POOL_IDLE_TIMEOUT)
            .build::<_, AxumBody>(https_connector);

        tracing::info!("Created new HTTP client with HTTP/2 and HTTP/1.1 support");
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpClient for HttpClientAdapter {
    async fn send_request(
        &self,
        mut req: Request<AxumBody>,
    ) -> HttpClientResult<Response<AxumBody>> {
        let client = self.client.clone();

        // Set Host header from the target URL
        if let Some(host_str) = req.uri().host() {
            let host_header_val = if let Some(port) = req.uri().port() {
                HeaderValue::from_str(&format!("{host_str}:{}", port.as_u16()))
                    .unwrap_or_else(|_| HeaderValue::from_static(""))
            } else {
                HeaderValue::from_str(host_str).unwrap_or_else(|_| HeaderValue::from_static(""))
            };
            if !host_header_val.is_empty() {
                req.headers_mut().insert(header::HOST, host_header_val);
            }
        } else {
            tracing::error!("Outgoing URI has no host: {}", req.uri());
            return Err(HttpClientError::InvalidRequest(
                "Outgoing URI has no host".to_string(),
            ));
        }

        let (mut parts, body) = req.into_parts();
        parts.version = Version::HTTP_11;

        tracing::debug!(
            method = %parts.method,
            uri = %parts.uri,
            "sending upstream request (HTTP/1.1, ALPN negotiates actual version)"
        );

        let outgoing_request = Request::from_parts(parts, body);

        let method_for_error_log = outgoing_request.method().clone();
        let uri_for_error_log = outgoing_request.uri().clone();

        match client.request(outgoing_request).await {
            Ok(response) => {
                let (mut parts, hyper_body) = response.into_parts();

                // Remove Transfer-Encoding since the body is re-framed by
                // the caller.
                parts.headers.remove(header::TRANSFER_ENCODING);

                Ok(Response::from_parts(parts, AxumBody::new(hyper_body)))
            }
            Err(e) => {
                tracing::error!(
                    method = %method_for_error_log,
                    uri = %uri_for_error_log,
                    error = %e,
                    "upstream request failed"
                );

                Err(HttpClientError::ConnectionError(format!(
                    "Request to {method_for_error_log} {uri_for_error_log} failed: {e}"
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_http_client_creation() {
        let client = HttpClientAdapter::new();
        assert!(client.is_ok());
    }

    #[tokio::test]
    async fn test_request_without_host_is_rejected() {
        let client = HttpClientAdapter::new().unwrap();
        let request = Request::builder()
            .uri("/relative/only")
            .body(AxumBody::empty())
            .unwrap();

        match client.send_request(request).await {
            Err(HttpClientError::InvalidRequest(_)) => {}
            other => panic!("expected InvalidRequest, got {other:?}"),
        }
    }
}
