//! Fan-out dispatcher.
//!
//! Buffers the inbound body once (bounded at 5 MiB), then launches one task
//! per upstream under a weighted semaphore sized to the route's parallelism
//! bound. Results land in preallocated slots so aggregation order is the
//! configured upstream order regardless of completion order. Post-call
//! policy checks and latency observations happen here, after each upstream
//! call returns.
use std::{net::IpAddr, sync::Arc, time::Instant};

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use eyre::{Result, WrapErr};
use http_body_util::BodyExt;
use hyper::http::request::Parts;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::{
    core::{
        router::Route,
        upstream::{InboundRequest, UpstreamError, UpstreamErrorKind, UpstreamResponse},
    },
    metrics::{FailReason, Metrics},
};

/// Hard cap on the buffered inbound body.
pub const MAX_INBOUND_BODY_SIZE: usize = 5 * 1024 * 1024;

pub struct Dispatcher {
    metrics: Arc<dyn Metrics>,
}

impl Dispatcher {
    pub fn new(metrics: Arc<dyn Metrics>) -> Self {
        Self { metrics }
    }

    /// Fan the request out to every upstream of the route.
    ///
    /// Returns `None` iff the inbound body could not be read or exceeds the
    /// global size cap; otherwise the result has exactly one slot per
    /// upstream, index-aligned with `route.upstreams`.
    pub async fn dispatch(
        &self,
        route: &Route,
        head: &Parts,
        body: Body,
        client_ip: Option<IpAddr>,
        cancel: &CancellationToken,
    ) -> Option<Vec<UpstreamResponse>> {
        let body = match read_buffered_body(body, MAX_INBOUND_BODY_SIZE).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                tracing::warn!(path = head.uri.path(), "inbound body exceeds size cap");
                self.metrics
                    .inc_failed_requests_total(FailReason::BodyTooLarge);
                return None;
            }
            Err(e) => {
                tracing::error!(error = %e, "cannot read inbound body");
                return None;
            }
        };

        let inbound = Arc::new(InboundRequest {
            method: head.method.clone(),
            uri: head.uri.clone(),
            headers: head.headers.clone(),
            client_ip,
            body,
        });

        let semaphore = Arc::new(Semaphore::new(route.max_parallel_upstreams));
        let mut tasks = Vec::with_capacity(route.upstreams.len());

        for (i, upstream) in route.upstreams.iter().enumerate() {
            let upstream = Arc::clone(upstream);
            let inbound = Arc::clone(&inbound);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let metrics = Arc::clone(&self.metrics);
            let route_path = route.path.clone();

            tasks.push(tokio::spawn(async move {
                let _permit = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return (i, canceled_response());
                    }
                    permit = semaphore.acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => return (i, canceled_response()),
                    },
                };

                let start = Instant::now();
                let mut response = upstream.call(&inbound, &cancel).await;
                metrics.observe_upstream_latency(
                    &route_path,
                    inbound.method.as_str(),
                    upstream.name(),
                    start.elapsed(),
                );

                if let Some(err) = &response.err {
                    tracing::error!(
                        upstream = upstream.name(),
                        kind = %err.kind,
                        cause = ?err.cause(),
                        "upstream call failed"
                    );
                    metrics.inc_failed_requests_total(FailReason::UpstreamError);
                }

                if upstream.policy().apply_post_checks(&mut response) {
                    tracing::warn!(upstream = upstream.name(), "upstream policy violation");
                    metrics.inc_failed_requests_total(FailReason::PolicyViolation);
                }

                (i, response)
            }));
        }

        let mut slots: Vec<Option<UpstreamResponse>> = Vec::with_capacity(route.upstreams.len());
        slots.resize_with(route.upstreams.len(), || None);

        for task in tasks {
            match task.await {
                Ok((i, response)) => slots[i] = Some(response),
                Err(e) => {
                    // The recoverer middleware cannot see into spawned
                    // tasks, so a panicking upstream task is absorbed here.
                    tracing::error!(error = %e, "upstream task failed");
                }
            }
        }

        Some(
            slots
                .into_iter()
                .map(|slot| {
                    slot.unwrap_or_else(|| UpstreamResponse {
                        err: Some(UpstreamError::with_cause(
                            UpstreamErrorKind::Internal,
                            "upstream task aborted",
                        )),
                        ..Default::default()
                    })
                })
                .collect(),
        )
    }
}

fn canceled_response() -> UpstreamResponse {
    UpstreamResponse {
        err: Some(UpstreamError::with_cause(
            UpstreamErrorKind::Canceled,
            "request canceled before dispatch",
        )),
        ..Default::default()
    }
}

/// Buffer the body, refusing anything over `limit`. `Ok(None)` signals the
/// cap was exceeded; the body is read exactly once either way.
async fn read_buffered_body(body: Body, limit: usize) -> Result<Option<Bytes>> {
    let mut body = body;
    let mut buf = BytesMut::new();

    while let Some(frame) = body.frame().await {
        let frame = frame.wrap_err("inbound body read failed")?;
        if let Ok(data) = frame.into_data() {
            if buf.len() + data.len() > limit {
                return Ok(None);
            }
            buf.extend_from_slice(&data);
        }
    }

    Ok(Some(buf.freeze()))
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use async_trait::async_trait;
    use hyper::{Method, Request};

    use super::*;
    use crate::{
        config::models::AggregationConfig,
        core::{policy::Policy, upstream::Upstream},
        metrics::NopMetrics,
    };

    /// Upstream double that waits, tracks concurrency, and echoes its name.
    struct SlowUpstream {
        name: String,
        delay: Duration,
        policy: Policy,
        in_flight: Arc<AtomicUsize>,
        max_in_flight: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Upstream for SlowUpstream {
        fn name(&self) -> &str {
            &self.name
        }

        fn policy(&self) -> &Policy {
            &self.policy
        }

        async fn call(
            &self,
            _inbound: &InboundRequest,
            _cancel: &CancellationToken,
        ) -> UpstreamResponse {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            UpstreamResponse {
                status: 200,
                body: Bytes::from(self.name.clone()),
                ..Default::default()
            }
        }
    }

    fn route_with(upstreams: Vec<Arc<dyn Upstream>>, max_parallel: usize) -> Route {
        Route {
            path: "/t".to_string(),
            method: Some(Method::GET),
            upstreams,
            aggregation: AggregationConfig::default(),
            max_parallel_upstreams: max_parallel,
            plugins: Vec::new(),
        }
    }

    fn slow_upstreams(
        count: usize,
        delay: Duration,
    ) -> (Vec<Arc<dyn Upstream>>, Arc<AtomicUsize>) {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let upstreams = (0..count)
            .map(|i| {
                Arc::new(SlowUpstream {
                    name: format!("u{i}"),
                    delay,
                    policy: Policy::default(),
                    in_flight: Arc::clone(&in_flight),
                    max_in_flight: Arc::clone(&max_in_flight),
                }) as Arc<dyn Upstream>
            })
            .collect();
        (upstreams, max_in_flight)
    }

    fn request_head() -> Parts {
        let (parts, _) = Request::builder()
            .method(Method::GET)
            .uri("http://gw/t")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    #[tokio::test]
    async fn test_slots_align_with_upstream_order() {
        let (upstreams, _) = slow_upstreams(4, Duration::from_millis(1));
        let route = route_with(upstreams, 4);
        let dispatcher = Dispatcher::new(NopMetrics::shared());

        let responses = dispatcher
            .dispatch(
                &route,
                &request_head(),
                Body::empty(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(responses.len(), 4);
        for (i, response) in responses.iter().enumerate() {
            assert_eq!(&response.body[..], format!("u{i}").as_bytes());
        }
    }

    #[tokio::test]
    async fn test_parallelism_is_bounded() {
        let (upstreams, max_in_flight) = slow_upstreams(6, Duration::from_millis(20));
        let route = route_with(upstreams, 2);
        let dispatcher = Dispatcher::new(NopMetrics::shared());

        dispatcher
            .dispatch(
                &route,
                &request_head(),
                Body::empty(),
                None,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(max_in_flight.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_oversized_body_returns_sentinel() {
        let (upstreams, max_in_flight) = slow_upstreams(1, Duration::from_millis(1));
        let route = route_with(upstreams, 1);
        let dispatcher = Dispatcher::new(NopMetrics::shared());

        let big = vec![0u8; MAX_INBOUND_BODY_SIZE + 1];
        let result = dispatcher
            .dispatch(
                &route,
                &request_head(),
                Body::from(big),
                None,
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_none());
        // No upstream was called.
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancelled_dispatch_settles_with_canceled_slots() {
        let (upstreams, _) = slow_upstreams(2, Duration::from_millis(50));
        let route = route_with(upstreams, 1);
        let dispatcher = Dispatcher::new(NopMetrics::shared());

        let cancel = CancellationToken::new();
        cancel.cancel();

        let responses = dispatcher
            .dispatch(&route, &request_head(), Body::empty(), None, &cancel)
            .await
            .unwrap();

        assert_eq!(responses.len(), 2);
        for response in &responses {
            assert_eq!(
                response.err.as_ref().unwrap().kind,
                UpstreamErrorKind::Canceled
            );
        }
    }

    #[tokio::test]
    async fn test_body_at_cap_is_accepted() {
        let body = vec![0u8; MAX_INBOUND_BODY_SIZE];
        let result = read_buffered_body(Body::from(body), MAX_INBOUND_BODY_SIZE)
            .await
            .unwrap();
        assert_eq!(result.unwrap().len(), MAX_INBOUND_BODY_SIZE);
    }
}
