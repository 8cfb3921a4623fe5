//! Upstream call machinery.
//!
//! An [`HttpUpstream`] owns everything needed to talk to one upstream
//! service: candidate hosts (round-robined), forwarding rules for headers
//! and query strings, a per-attempt timeout, the response [`Policy`] and an
//! optional [`CircuitBreaker`]. [`Upstream::call`] runs the bounded retry
//! loop around single attempts and feeds the breaker with the outcome of
//! each attempt.
use std::{
    net::IpAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::body::Body as AxumBody;
use bytes::{Bytes, BytesMut};
use eyre::{Result, WrapErr};
use http_body_util::BodyExt;
use hyper::{
    HeaderMap, Method, Request, Uri,
    header::{self, HeaderName, HeaderValue},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::models::UpstreamConfig,
    core::{circuit_breaker::CircuitBreaker, policy::Policy},
    ports::http_client::{HttpClient, HttpClientError},
    tracing_setup,
};

/// Classification of a failed upstream call. The kind is what the
/// aggregator maps to a client error code; the inner cause is for logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamErrorKind {
    Timeout,
    Canceled,
    Connection,
    BadStatus,
    ReadError,
    BodyTooLarge,
    CircuitOpen,
    Internal,
}

impl UpstreamErrorKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::Connection => "connection",
            Self::BadStatus => "bad_status",
            Self::ReadError => "read_error",
            Self::BodyTooLarge => "body_too_large",
            Self::CircuitOpen => "circuit_open",
            Self::Internal => "internal",
        }
    }
}

impl std::fmt::Display for UpstreamErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An upstream call failure. `Display` surfaces only the kind; the cause
/// stays internal and is never serialized to clients.
#[derive(Debug, Error)]
#[error("{kind}")]
pub struct UpstreamError {
    pub kind: UpstreamErrorKind,
    #[source]
    cause: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl UpstreamError {
    pub fn new(kind: UpstreamErrorKind) -> Self {
        Self { kind, cause: None }
    }

    pub fn with_cause(
        kind: UpstreamErrorKind,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self {
            kind,
            cause: Some(cause.into()),
        }
    }

    /// Append a note to the cause chain without changing the kind.
    pub fn append_cause(&mut self, note: &str) {
        self.cause = Some(match self.cause.take() {
            Some(prev) => format!("{note}; {prev}").into(),
            None => note.to_string().into(),
        });
    }

    pub fn cause(&self) -> Option<&(dyn std::error::Error + Send + Sync)> {
        self.cause.as_deref()
    }
}

/// The outcome of one upstream exchange after retries: the last attempt's
/// status, headers and body, plus the error (if any).
#[derive(Debug, Default)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub err: Option<UpstreamError>,
}

impl UpstreamResponse {
    pub fn from_kind(kind: UpstreamErrorKind) -> Self {
        Self {
            err: Some(UpstreamError::new(kind)),
            ..Default::default()
        }
    }
}

/// Buffered, read-only snapshot of the inbound request, shared by every
/// upstream task of one dispatch.
#[derive(Debug)]
pub struct InboundRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub client_ip: Option<IpAddr>,
    pub body: Bytes,
}

#[async_trait]
pub trait Upstream: Send + Sync {
    fn name(&self) -> &str;
    fn policy(&self) -> &Policy;

    /// Perform the exchange with this upstream, honoring the retry policy
    /// and the request's cancellation token.
    async fn call(&self, inbound: &InboundRequest, cancel: &CancellationToken)
    -> UpstreamResponse;
}

/// HTTP implementation of [`Upstream`].
pub struct HttpUpstream {
    name: String,
    hosts: Vec<String>,
    host_cursor: AtomicU64,
    method: Option<Method>,
    timeout: Duration,
    headers: Vec<(String, String)>,
    forward_headers: Vec<String>,
    forward_query_strings: Vec<String>,
    policy: Policy,

    circuit_breaker: Option<CircuitBreaker>,
    client: Arc<dyn HttpClient>,
}

impl HttpUpstream {
    /// Build an upstream from its configuration. Durations are parsed here;
    /// the config has already been validated.
    pub fn from_config(cfg: &UpstreamConfig, client: Arc<dyn HttpClient>) -> Result<Self> {
        let method = if cfg.method.is_empty() {
            None
        } else {
            Some(
                Method::from_bytes(cfg.method.to_uppercase().as_bytes())
                    .wrap_err_with(|| format!("invalid upstream method {:?}", cfg.method))?,
            )
        };

        let timeout = humantime::parse_duration(&cfg.timeout)
            .wrap_err_with(|| format!("invalid upstream timeout {:?}", cfg.timeout))?;

        let policy = Policy::from_config(&cfg.policy)?;

        let circuit_breaker = policy.circuit_breaker.enabled.then(|| {
            CircuitBreaker::new(
                policy.circuit_breaker.max_failures,
                policy.circuit_breaker.reset_timeout,
            )
        });

        let name = if cfg.name.is_empty() {
            make_upstream_name(method.as_ref(), &cfg.hosts)
        } else {
            cfg.name.clone()
        };

        Ok(Self {
            name,
            hosts: cfg.hosts.clone(),
            host_cursor: AtomicU64::new(0),
            method,
            timeout,
            headers: cfg.headers.clone().into_iter().collect(),
            forward_headers: cfg.forward_headers.clone(),
            forward_query_strings: cfg.forward_query_strings.clone(),
            policy,
            circuit_breaker,
            client,
        })
    }

    /// Pick the next host. A single host avoids the atomic entirely.
    fn select_host(&self) -> &str {
        if self.hosts.len() == 1 {
            return &self.hosts[0];
        }

        let idx = self.host_cursor.fetch_add(1, Ordering::Relaxed);
        let host = &self.hosts[(idx % self.hosts.len() as u64) as usize];
        tracing::debug!(upstream = %self.name, host = %host, "new host selected");
        host
    }

    fn build_request(&self, inbound: &InboundRequest) -> Result<Request<AxumBody>> {
        let method = self.method.clone().unwrap_or_else(|| inbound.method.clone());

        // Forward the body only for body-acceptable methods.
        let body = if matches!(method, Method::POST | Method::PUT | Method::PATCH) {
            AxumBody::from(inbound.body.clone())
        } else {
            AxumBody::empty()
        };

        let target = self.resolve_uri(inbound)?;

        let mut request = Request::builder()
            .method(method)
            .uri(target)
            .body(body)
            .wrap_err("cannot build upstream request")?;

        self.resolve_headers(request.headers_mut(), inbound);

        Ok(request)
    }

    /// Combine the configured host URL with the forwarded query strings.
    fn resolve_uri(&self, inbound: &InboundRequest) -> Result<Uri> {
        let host = self.select_host();
        let mut target = url::Url::parse(host)
            .wrap_err_with(|| format!("invalid upstream host URL {host:?}"))?;

        let original: Vec<(String, String)> = inbound
            .uri
            .query()
            .map(|q| {
                url::form_urlencoded::parse(q.as_bytes())
                    .into_owned()
                    .collect()
            })
            .unwrap_or_default();

        let mut forwarded: Vec<(String, String)> = target
            .query_pairs()
            .into_owned()
            .collect();

        for rule in &self.forward_query_strings {
            if rule == "*" {
                forwarded = original.clone();
                break;
            }

            if let Some(prefix) = rule.strip_suffix('*') {
                for (key, value) in &original {
                    if key.starts_with(prefix) {
                        forwarded.push((key.clone(), value.clone()));
                    }
                }
                continue;
            }

            if let Some((key, value)) = original.iter().find(|(key, _)| key == rule) {
                if !value.is_empty() {
                    forwarded.push((key.clone(), value.clone()));
                }
            }
        }

        if forwarded.is_empty() {
            target.set_query(None);
        } else {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .extend_pairs(forwarded)
                .finish();
            target.set_query(Some(&query));
        }

        target
            .as_str()
            .parse::<Uri>()
            .wrap_err("cannot parse upstream URI")
    }

    fn resolve_headers(&self, target: &mut HeaderMap, inbound: &InboundRequest) {
        for rule in &self.forward_headers {
            if rule == "*" {
                *target = inbound.headers.clone();
                break;
            }

            if let Some(prefix) = rule.strip_suffix('*') {
                let prefix = prefix.to_ascii_lowercase();
                for (name, value) in &inbound.headers {
                    if name.as_str().starts_with(&prefix) {
                        target.append(name.clone(), value.clone());
                    }
                }
                continue;
            }

            if let Ok(name) = HeaderName::try_from(rule.as_str()) {
                if let Some(value) = inbound.headers.get(&name) {
                    target.append(name, value.clone());
                }
            }
        }

        // Static overrides rewrite only headers that were actually forwarded
        // (or everything, when the forward list contains "*").
        let forward_all = self.forward_headers.iter().any(|rule| rule == "*");
        for (name, value) in &self.headers {
            let Ok(header_name) = HeaderName::try_from(name.as_str()) else {
                tracing::warn!(upstream = %self.name, header = %name, "invalid override header name");
                continue;
            };
            if !forward_all && !target.contains_key(&header_name) {
                continue;
            }
            match HeaderValue::from_str(value) {
                Ok(header_value) => {
                    target.insert(header_name, header_value);
                }
                Err(_) => {
                    tracing::warn!(upstream = %self.name, header = %name, "invalid override header value");
                }
            }
        }

        // Always forward the Content-Type header.
        if let Some(content_type) = inbound.headers.get(header::CONTENT_TYPE) {
            target.insert(header::CONTENT_TYPE, content_type.clone());
        }

        if let Some(ip) = inbound.client_ip {
            if let Ok(value) = HeaderValue::from_str(&ip.to_string()) {
                target.append("X-Forwarded-For", value);
            }
        }
    }

    /// One attempt: build the request, send it under the attempt deadline,
    /// classify the outcome and read the (limited) body.
    async fn attempt(
        &self,
        inbound: &InboundRequest,
        cancel: &CancellationToken,
    ) -> UpstreamResponse {
        let mut uresp = UpstreamResponse::default();

        let request = match self.build_request(inbound) {
            Ok(request) => request,
            Err(e) => {
                uresp.err = Some(UpstreamError::with_cause(UpstreamErrorKind::Internal, e));
                return uresp;
            }
        };

        let deadline = tokio::time::Instant::now() + self.timeout;

        let sent = tokio::select! {
            _ = cancel.cancelled() => {
                uresp.err = Some(UpstreamError::with_cause(
                    UpstreamErrorKind::Canceled,
                    "request canceled",
                ));
                return uresp;
            }
            result = tokio::time::timeout_at(deadline, self.client.send_request(request)) => result,
        };

        let response = match sent {
            Err(_elapsed) => {
                tracing::error!(upstream = %self.name, timeout = ?self.timeout, "upstream attempt timed out");
                uresp.err = Some(UpstreamError::with_cause(
                    UpstreamErrorKind::Timeout,
                    "attempt deadline exceeded",
                ));
                return uresp;
            }
            Ok(Err(e)) => {
                tracing::error!(upstream = %self.name, error = %e, "non-successful upstream request");
                let kind = match &e {
                    HttpClientError::InvalidRequest(_) => UpstreamErrorKind::Internal,
                    _ => UpstreamErrorKind::Connection,
                };
                uresp.err = Some(UpstreamError::with_cause(kind, e));
                return uresp;
            }
            Ok(Ok(response)) => response,
        };

        uresp.status = response.status().as_u16();

        // A 5xx response is a failure; the body is not read.
        if uresp.status >= 500 {
            tracing::error!(upstream = %self.name, status = uresp.status, "upstream error response status");
            uresp.err = Some(UpstreamError::with_cause(
                UpstreamErrorKind::BadStatus,
                "upstream error",
            ));
            return uresp;
        }

        uresp.headers = response.headers().clone();

        let limit = self.policy.max_response_body_size;
        let mut body = response.into_body();
        let mut buf = BytesMut::new();

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => {
                    uresp.err = Some(UpstreamError::with_cause(
                        UpstreamErrorKind::Canceled,
                        "request canceled while reading body",
                    ));
                    return uresp;
                }
                result = tokio::time::timeout_at(deadline, body.frame()) => match result {
                    Err(_elapsed) => {
                        uresp.err = Some(UpstreamError::with_cause(
                            UpstreamErrorKind::ReadError,
                            "attempt deadline exceeded while reading body",
                        ));
                        return uresp;
                    }
                    Ok(frame) => frame,
                },
            };

            match frame {
                None => break,
                Some(Err(e)) => {
                    uresp.err = Some(UpstreamError::with_cause(UpstreamErrorKind::ReadError, e));
                    return uresp;
                }
                Some(Ok(frame)) => {
                    if let Ok(data) = frame.into_data() {
                        buf.extend_from_slice(&data);
                        if limit > 0 && buf.len() as u64 > limit {
                            uresp.err = Some(UpstreamError::new(UpstreamErrorKind::BodyTooLarge));
                            return uresp;
                        }
                    }
                }
            }
        }

        uresp.body = buf.freeze();
        uresp
    }

    /// Breaker failures are health signals only: timeouts, connection
    /// failures and 5xx statuses. Cancellations and request-correctness
    /// issues do not trip the breaker.
    fn is_breaker_failure(err: &UpstreamError) -> bool {
        matches!(
            err.kind,
            UpstreamErrorKind::Timeout | UpstreamErrorKind::Connection | UpstreamErrorKind::BadStatus
        )
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    fn name(&self) -> &str {
        &self.name
    }

    fn policy(&self) -> &Policy {
        &self.policy
    }

    async fn call(
        &self,
        inbound: &InboundRequest,
        cancel: &CancellationToken,
    ) -> UpstreamResponse {
        let retry = &self.policy.retry;
        let method = self.method.as_ref().unwrap_or(&inbound.method).clone();
        let mut resp = UpstreamResponse::default();

        for attempt in 0..=retry.max_retries {
            // Checked before the breaker so a canceled request can never
            // consume the single HalfOpen probe.
            if cancel.is_cancelled() {
                resp.err = Some(UpstreamError::with_cause(
                    UpstreamErrorKind::Canceled,
                    "request canceled",
                ));
                return resp;
            }

            if let Some(breaker) = &self.circuit_breaker {
                if !breaker.allow() {
                    tracing::error!(upstream = %self.name, "circuit breaker denied request");
                    return UpstreamResponse {
                        err: Some(UpstreamError::with_cause(
                            UpstreamErrorKind::CircuitOpen,
                            "upstream circuit breaker is open",
                        )),
                        ..Default::default()
                    };
                }
            }

            let span = tracing_setup::create_upstream_span(&self.name, method.as_str());
            resp = self.attempt(inbound, cancel).instrument(span.clone()).await;
            if resp.status > 0 {
                span.record("http.status_code", resp.status);
            }

            if let Some(breaker) = &self.circuit_breaker {
                match &resp.err {
                    Some(err) if Self::is_breaker_failure(err) => {
                        tracing::error!(upstream = %self.name, "upstream request failed, feeding circuit breaker");
                        breaker.on_failure();
                    }
                    _ => breaker.on_success(),
                }
            }

            if resp.err.is_none() && !retry.retry_on_statuses.contains(&resp.status) {
                break;
            }

            if attempt < retry.max_retries && !retry.backoff_delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(retry.backoff_delay) => {}
                    _ = cancel.cancelled() => {
                        resp.err = Some(UpstreamError::with_cause(
                            UpstreamErrorKind::Canceled,
                            "request canceled during backoff",
                        ));
                        return resp;
                    }
                }
            }
        }

        resp
    }
}

/// Fallback name for unnamed upstreams: `METHOD-host1-host2`.
fn make_upstream_name(method: Option<&Method>, hosts: &[String]) -> String {
    let method = method.map_or("ANY", |m| m.as_str());
    format!("{}-{}", method, hosts.join("-"))
}
