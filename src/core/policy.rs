//! Per-upstream response policies.
//!
//! A [`Policy`] travels with each upstream descriptor and controls which
//! responses are acceptable, how statuses are remapped, how large a body may
//! be, and the retry / circuit-breaker parameters. Post-call checks run in
//! the dispatcher after every upstream call returns.
use std::{collections::HashMap, time::Duration};

use eyre::{Result, WrapErr};

use crate::{
    config::models::PolicyConfig,
    core::upstream::{UpstreamError, UpstreamErrorKind, UpstreamResponse},
};

/// Response-handling rules for a single upstream.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    /// Statuses accepted from this upstream. Empty means all are allowed.
    pub allowed_statuses: Vec<u16>,
    /// Reject responses with an empty body.
    pub require_body: bool,
    /// Status remapping table applied before the allowed-statuses check.
    pub map_status_codes: HashMap<u16, u16>,
    /// Maximum response body size in bytes. Zero disables the limit.
    pub max_response_body_size: u64,

    pub retry: RetryPolicy,
    pub circuit_breaker: CircuitBreakerPolicy,
}

/// Retry behavior for an upstream: attempt count, which statuses re-trigger
/// an attempt, and the fixed delay between attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub retry_on_statuses: Vec<u16>,
    pub backoff_delay: Duration,
}

/// Circuit-breaker parameters for an upstream.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerPolicy {
    pub enabled: bool,
    pub max_failures: u32,
    pub reset_timeout: Duration,
}

impl Policy {
    /// Parse a validated policy configuration into its runtime form.
    pub fn from_config(cfg: &PolicyConfig) -> Result<Self> {
        let backoff_delay = humantime::parse_duration(&cfg.retry.backoff_delay)
            .wrap_err_with(|| format!("invalid backoff delay {:?}", cfg.retry.backoff_delay))?;
        let reset_timeout = humantime::parse_duration(&cfg.circuit_breaker.reset_timeout)
            .wrap_err_with(|| {
                format!(
                    "invalid breaker reset timeout {:?}",
                    cfg.circuit_breaker.reset_timeout
                )
            })?;

        Ok(Self {
            allowed_statuses: cfg.allowed_statuses.clone(),
            require_body: cfg.require_body,
            map_status_codes: cfg.map_status_codes.clone(),
            max_response_body_size: cfg.max_response_body_size,
            retry: RetryPolicy {
                max_retries: cfg.retry.max_retries,
                retry_on_statuses: cfg.retry.retry_on_statuses.clone(),
                backoff_delay,
            },
            circuit_breaker: CircuitBreakerPolicy {
                enabled: cfg.circuit_breaker.enabled,
                max_failures: cfg.circuit_breaker.max_failures,
                reset_timeout,
            },
        })
    }

    /// Apply the post-call checks to a completed upstream response:
    /// require-body, status remapping, then the allowed-statuses check
    /// against the possibly-remapped status. Returns whether any policy was
    /// violated. An existing error keeps its kind; the violation text is
    /// appended to its cause.
    pub fn apply_post_checks(&self, response: &mut UpstreamResponse) -> bool {
        let mut violated = false;

        if self.require_body && response.body.is_empty() {
            append_violation(response, "empty body not allowed by upstream policy");
            violated = true;
        }

        if let Some(&mapped) = self.map_status_codes.get(&response.status) {
            response.status = mapped;
        }

        if !self.allowed_statuses.is_empty() && !self.allowed_statuses.contains(&response.status) {
            append_violation(
                response,
                &format!("status {} not allowed by upstream policy", response.status),
            );
            violated = true;
        }

        violated
    }
}

fn append_violation(response: &mut UpstreamResponse, note: &str) {
    match &mut response.err {
        Some(err) => err.append_cause(note),
        None => {
            response.err = Some(UpstreamError::with_cause(UpstreamErrorKind::BadStatus, note));
        }
    }
}
