//! Plexus - an aggregating API gateway.
//!
//! Plexus maps one inbound HTTP request to a configured route, fans it out
//! to the route's upstream services in parallel, and merges the responses
//! into a single JSON envelope. The crate exposes the core building blocks
//! so the gateway can be embedded or composed inside another application.
//!
//! # Features
//! - Exact (method, path) route matching with per-route pipelines
//! - Bounded-concurrency fan-out with index-stable response collection
//! - `merge` / `array` aggregation with partial-result semantics
//! - Per-upstream retries, circuit breaker, status mapping and body limits
//! - Header / query-string forwarding rules (`name`, `prefix*`, `*`)
//! - Middleware and request/response plugin extension points with built-ins
//! - Optional fixed-window IP rate limiting
//! - Metrics facade (`metrics` crate) & structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use plexus::{
//!     ExtensionRegistry, Router, adapters::HttpClientAdapter, config, metrics::NopMetrics,
//! };
//!
//! # fn main() -> eyre::Result<()> {
//! let cfg = config::loader::load_config("plexus.yaml")?;
//! config::GatewayConfigValidator::validate(&cfg)?;
//!
//! let registry = ExtensionRegistry::with_builtins();
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let router = Router::new(
//!     cfg.router_config_set(),
//!     &registry,
//!     client,
//!     NopMetrics::shared(),
//! )?;
//! // Wire `router.handle(request)` into the server of your choice (see the
//! // binary crate for the axum wiring).
//! # let _ = router; Ok(()) }
//! ```
//!
//! # Architecture
//! The crate separates **ports** (traits) from **adapters**
//! (implementations) while keeping business logic inside `core`. End users
//! should prefer the re-exports documented below instead of reaching into
//! internal modules directly.
//!
//! # Error Handling
//! All fallible APIs return `eyre::Result<T>` or a domain specific error
//! type. Upstream failures are classified into kinds; only mapped client
//! error codes ever reach a response body.
pub mod config;
pub mod extensions;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;

// These modules are implementation details and should not be directly used by users
pub mod adapters;
pub mod core;

// Re-export the specific types needed by the binary crate and embedders
pub use crate::{
    adapters::HttpClientAdapter,
    core::{Route, Router},
    extensions::{ExtensionRegistry, Handler, Middleware, Plugin, PluginPhase},
    ports::http_client::HttpClient,
};
