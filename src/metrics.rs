//! Metrics sink for Plexus.
//!
//! The core only talks to the [`Metrics`] trait; [`NopMetrics`] is the
//! default and [`TelemetryMetrics`] forwards to the `metrics` crate facade
//! so any compatible recorder (the application initializes one externally)
//! can pick the values up.
//!
//! Provided metrics (labels vary by family):
//! * `plexus_requests_total` (counter)
//! * `plexus_responses_total` (counter, by route/status)
//! * `plexus_failed_requests_total` (counter, by reason)
//! * `plexus_requests_in_flight` (gauge)
//! * `plexus_request_duration_seconds` (histogram, by route/method)
//! * `plexus_upstream_latency_seconds` (histogram, by route/method/upstream)
use std::{sync::Arc, time::Duration};

use metrics::{Unit, counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use once_cell::sync::Lazy;

pub const PLEXUS_REQUESTS_TOTAL: &str = "plexus_requests_total";
pub const PLEXUS_RESPONSES_TOTAL: &str = "plexus_responses_total";
pub const PLEXUS_FAILED_REQUESTS_TOTAL: &str = "plexus_failed_requests_total";
pub const PLEXUS_REQUESTS_IN_FLIGHT: &str = "plexus_requests_in_flight";
pub const PLEXUS_REQUEST_DURATION_SECONDS: &str = "plexus_request_duration_seconds";
pub const PLEXUS_UPSTREAM_LATENCY_SECONDS: &str = "plexus_upstream_latency_seconds";

/// Why a request failed, as a stable metric label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailReason {
    NoMatchedRoute,
    BodyTooLarge,
    UpstreamError,
    PolicyViolation,
}

impl FailReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoMatchedRoute => "no_matched_route",
            Self::BodyTooLarge => "body_too_large",
            Self::UpstreamError => "upstream_error",
            Self::PolicyViolation => "policy_violation",
        }
    }
}

/// Sink for gateway observations. Implementations are responsible for their
/// own internal synchronization.
pub trait Metrics: Send + Sync {
    fn inc_requests_total(&self);
    fn inc_responses_total(&self, route: &str, status: u16);
    fn inc_requests_in_flight(&self);
    fn dec_requests_in_flight(&self);
    fn inc_failed_requests_total(&self, reason: FailReason);
    fn observe_request_duration(&self, route: &str, method: &str, duration: Duration);
    fn observe_upstream_latency(&self, route: &str, method: &str, upstream: &str, latency: Duration);
}

/// Discards every observation. The default when metrics are disabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct NopMetrics;

impl NopMetrics {
    pub fn shared() -> Arc<dyn Metrics> {
        Arc::new(Self)
    }
}

impl Metrics for NopMetrics {
    fn inc_requests_total(&self) {}
    fn inc_responses_total(&self, _route: &str, _status: u16) {}
    fn inc_requests_in_flight(&self) {}
    fn dec_requests_in_flight(&self) {}
    fn inc_failed_requests_total(&self, _reason: FailReason) {}
    fn observe_request_duration(&self, _route: &str, _method: &str, _duration: Duration) {}
    fn observe_upstream_latency(
        &self,
        _route: &str,
        _method: &str,
        _upstream: &str,
        _latency: Duration,
    ) {
    }
}

static DESCRIBE_METRICS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        PLEXUS_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of requests processed by the gateway."
    );
    describe_counter!(
        PLEXUS_RESPONSES_TOTAL,
        Unit::Count,
        "Total number of responses by route and status code."
    );
    describe_counter!(
        PLEXUS_FAILED_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of failed requests by reason."
    );
    describe_gauge!(
        PLEXUS_REQUESTS_IN_FLIGHT,
        "Current number of in-flight requests."
    );
    describe_histogram!(
        PLEXUS_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests processed by the gateway."
    );
    describe_histogram!(
        PLEXUS_UPSTREAM_LATENCY_SECONDS,
        Unit::Seconds,
        "Latency of individual upstream exchanges, retries included."
    );
});

/// Forwards observations to the `metrics` crate facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct TelemetryMetrics;

impl TelemetryMetrics {
    pub fn new() -> Self {
        Lazy::force(&DESCRIBE_METRICS);
        Self
    }

    pub fn shared() -> Arc<dyn Metrics> {
        Arc::new(Self::new())
    }
}

impl Metrics for TelemetryMetrics {
    fn inc_requests_total(&self) {
        counter!(PLEXUS_REQUESTS_TOTAL).increment(1);
    }

    fn inc_responses_total(&self, route: &str, status: u16) {
        counter!(
            PLEXUS_RESPONSES_TOTAL,
            "route" => route.to_string(),
            "status" => status.to_string()
        )
        .increment(1);
    }

    fn inc_requests_in_flight(&self) {
        gauge!(PLEXUS_REQUESTS_IN_FLIGHT).increment(1.0);
    }

    fn dec_requests_in_flight(&self) {
        gauge!(PLEXUS_REQUESTS_IN_FLIGHT).decrement(1.0);
    }

    fn inc_failed_requests_total(&self, reason: FailReason) {
        counter!(PLEXUS_FAILED_REQUESTS_TOTAL, "reason" => reason.as_str()).increment(1);
    }

    fn observe_request_duration(&self, route: &str, method: &str, duration: Duration) {
        histogram!(
            PLEXUS_REQUEST_DURATION_SECONDS,
            "route" => route.to_string(),
            "method" => method.to_string()
        )
        .record(duration.as_secs_f64());
    }

    fn observe_upstream_latency(
        &self,
        route: &str,
        method: &str,
        upstream: &str,
        latency: Duration,
    ) {
        histogram!(
            PLEXUS_UPSTREAM_LATENCY_SECONDS,
            "route" => route.to_string(),
            "method" => method.to_string(),
            "upstream" => upstream.to_string()
        )
        .record(latency.as_secs_f64());
    }
}
