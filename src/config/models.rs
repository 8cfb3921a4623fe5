//! Configuration data structures for Plexus.
//!
//! These types map directly to YAML (also JSON / TOML) configuration files.
//! They are intentionally serde-friendly and include defaults so that
//! minimal configs remain concise. Durations are humantime strings ("3s",
//! "250ms") parsed when the runtime objects are built.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Top-level gateway configuration file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub name: String,
    pub version: String,
    pub server: ServerConfig,
    pub routes: Vec<RouteConfig>,
    /// Middlewares applied to every route, in order.
    pub middlewares: Vec<MiddlewareConfig>,
    pub features: FeatureConfig,
}

impl GatewayConfig {
    /// The slice of the configuration consumed by the core router.
    pub fn router_config_set(&self) -> RouterConfigSet {
        RouterConfigSet {
            routes: self.routes.clone(),
            middlewares: self.middlewares.clone(),
            features: self.features.clone(),
            metrics: self.server.metrics.clone(),
        }
    }
}

/// Listener-level settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    /// Read/write timeout for the inbound server.
    pub timeout: String,
    pub metrics: MetricsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            timeout: "5s".to_string(),
            metrics: MetricsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
}

/// Everything the router needs from the loaded configuration.
#[derive(Debug, Clone, Default)]
pub struct RouterConfigSet {
    pub routes: Vec<RouteConfig>,
    pub middlewares: Vec<MiddlewareConfig>,
    pub features: FeatureConfig,
    pub metrics: MetricsConfig,
}

/// One route: an exact (method, path) key plus the upstreams it fans out to.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RouteConfig {
    pub path: String,
    /// Empty matches any method.
    pub method: String,
    pub upstreams: Vec<UpstreamConfig>,
    pub aggregation: AggregationConfig,
    /// Fan-out concurrency bound. Defaults to twice the logical CPU count.
    pub max_parallel_upstreams: Option<usize>,
    pub plugins: Vec<PluginConfig>,
    pub middlewares: Vec<MiddlewareConfig>,
}

/// One upstream service of a route.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Stable name for logs and metrics. Empty derives `METHOD-host1-host2`.
    pub name: String,
    /// Candidate host URLs, round-robined.
    pub hosts: Vec<String>,
    /// Outbound method. Empty falls back to the inbound method.
    pub method: String,
    /// Per-attempt timeout.
    pub timeout: String,
    /// Static header overrides, applied only to forwarded header names.
    pub headers: HashMap<String, String>,
    /// Header forwarding rules: exact names, `prefix*` globs, or `*`.
    pub forward_headers: Vec<String>,
    /// Query-string forwarding rules with the same grammar.
    pub forward_query_strings: Vec<String>,
    pub policy: PolicyConfig,
}

/// Response-handling policy of an upstream.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PolicyConfig {
    pub allowed_statuses: Vec<u16>,
    pub require_body: bool,
    pub map_status_codes: HashMap<u16, u16>,
    pub max_response_body_size: u64,
    pub retry: RetryConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub retry_on_statuses: Vec<u16>,
    pub backoff_delay: String,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            retry_on_statuses: Vec::new(),
            backoff_delay: "0s".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub enabled: bool,
    pub max_failures: u32,
    pub reset_timeout: String,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_failures: 5,
            reset_timeout: "30s".to_string(),
        }
    }
}

/// How the responses of a multi-upstream route are combined.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AggregationConfig {
    pub strategy: AggregationStrategy,
    pub allow_partial_results: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AggregationStrategy {
    #[default]
    Merge,
    Array,
    /// Anything the validator has not seen. Rejected by validation; the
    /// aggregator degrades to an empty envelope if one slips through.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MiddlewareConfig {
    pub name: String,
    /// A route-level middleware with `override = true` replaces the global
    /// middleware of the same name instead of appending.
    #[serde(rename = "override")]
    pub override_global: bool,
    pub config: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PluginConfig {
    pub name: String,
    pub config: HashMap<String, serde_json::Value>,
}

/// Optional gateway-wide features.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct FeatureConfig {
    pub ratelimit: RateLimitConfig,
}

/// Fixed-window rate limiting keyed by client IP.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    /// Requests allowed per window.
    pub limit: u32,
    pub window: String,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            limit: 60,
            window: "60s".to_string(),
        }
    }
}

pub(crate) fn default_upstream_timeout() -> String {
    "3s".to_string()
}

impl UpstreamConfig {
    /// Apply loader defaults that serde's `default` cannot express (an
    /// empty timeout means "use the default").
    pub fn normalized(mut self) -> Self {
        if self.timeout.is_empty() {
            self.timeout = default_upstream_timeout();
        }
        self
    }
}
