//! Request router and per-route pipeline.
//!
//! The router owns the immutable route table built from a validated
//! [`RouterConfigSet`]. Matching is first-wins on (method, exact path).
//! Every route gets a pipeline handler (request plugins, dispatch,
//! aggregation, envelope, response plugins) wrapped at build time by its
//! middleware chain so the first configured middleware is the outermost
//! caller.
use std::{collections::HashMap, net::{IpAddr, SocketAddr}, sync::Arc, time::Instant};

use async_trait::async_trait;
use axum::{body::Body, extract::ConnectInfo};
use eyre::{Result, WrapErr};
use hyper::{
    HeaderMap, Method, Request, Response, StatusCode,
    header::{self, HeaderValue},
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    config::models::{AggregationConfig, RouterConfigSet},
    core::{
        aggregator::Aggregator,
        context::{Context, PluginResponse},
        dispatcher::Dispatcher,
        envelope::{
            ERROR_CODE_INTERNAL, ERROR_CODE_PAYLOAD_TOO_LARGE, ERROR_CODE_RATE_LIMIT_EXCEEDED,
            HEADER_REQUEST_ID, envelope_body, error_response, not_found_response,
        },
        rate_limiter::RateLimiter,
        upstream::{HttpUpstream, Upstream, UpstreamResponse},
    },
    extensions::{
        middleware::{Handler, Middleware, compose},
        plugin::{Plugin, PluginPhase},
        registry::ExtensionRegistry,
    },
    metrics::{FailReason, Metrics},
    ports::http_client::HttpClient,
    tracing_setup,
};

/// A matched unit of configuration: exact path, optional method, the
/// upstreams to fan out to and the plugins that run around dispatch.
/// Immutable after build.
pub struct Route {
    pub path: String,
    /// `None` matches any method.
    pub method: Option<Method>,
    pub upstreams: Vec<Arc<dyn Upstream>>,
    pub aggregation: AggregationConfig,
    pub max_parallel_upstreams: usize,
    pub plugins: Vec<Arc<dyn Plugin>>,
}

/// Request id carried through the middleware chain in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

struct RouteEntry {
    route: Arc<Route>,
    handler: Arc<dyn Handler>,
}

pub struct Router {
    routes: Vec<RouteEntry>,
    rate_limiter: Option<Arc<RateLimiter>>,
    metrics: Arc<dyn Metrics>,
}

impl Router {
    /// Build the route table from a validated configuration.
    pub fn new(
        cfg: RouterConfigSet,
        registry: &ExtensionRegistry,
        client: Arc<dyn HttpClient>,
        metrics: Arc<dyn Metrics>,
    ) -> Result<Self> {
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&metrics)));

        let mut global_indices = HashMap::new();
        let mut globals: Vec<Arc<dyn Middleware>> = Vec::new();
        for mcfg in &cfg.middlewares {
            let middleware = registry
                .create_middleware(mcfg)
                .wrap_err_with(|| format!("cannot initialize global middleware {:?}", mcfg.name))?;
            global_indices.insert(middleware.name().to_string(), globals.len());
            globals.push(middleware);
        }

        let mut routes = Vec::with_capacity(cfg.routes.len());
        for rcfg in &cfg.routes {
            let upstreams = rcfg
                .upstreams
                .iter()
                .map(|ucfg| {
                    HttpUpstream::from_config(ucfg, Arc::clone(&client))
                        .map(|upstream| Arc::new(upstream) as Arc<dyn Upstream>)
                })
                .collect::<Result<Vec<_>>>()
                .wrap_err_with(|| format!("route {} {}", rcfg.method, rcfg.path))?;

            // Plugins are deduplicated by name; the first occurrence wins.
            let mut plugins: Vec<Arc<dyn Plugin>> = Vec::with_capacity(rcfg.plugins.len());
            for pcfg in &rcfg.plugins {
                if plugins.iter().any(|plugin| plugin.name() == pcfg.name) {
                    tracing::warn!(plugin = %pcfg.name, route = %rcfg.path, "duplicate plugin skipped");
                    continue;
                }
                let plugin = registry
                    .create_plugin(pcfg)
                    .wrap_err_with(|| format!("cannot initialize plugin {:?}", pcfg.name))?;
                tracing::info!(
                    plugin = plugin.name(),
                    route = format!("{} {}", rcfg.method, rcfg.path),
                    "plugin initialized"
                );
                plugins.push(plugin);
            }

            // Route middlewares: override replaces the same-named global in
            // place, everything else appends after the globals.
            let mut chain = globals.clone();
            let mut locals = Vec::new();
            for mcfg in &rcfg.middlewares {
                let middleware = registry.create_middleware(mcfg).wrap_err_with(|| {
                    format!("cannot initialize middleware {:?}", mcfg.name)
                })?;
                tracing::info!(
                    middleware = middleware.name(),
                    route = format!("{} {}", rcfg.method, rcfg.path),
                    "middleware initialized"
                );

                if mcfg.override_global {
                    if let Some(&idx) = global_indices.get(middleware.name()) {
                        chain[idx] = middleware;
                        continue;
                    }
                }
                locals.push(middleware);
            }
            chain.extend(locals);

            let method = if rcfg.method.is_empty() {
                None
            } else {
                Some(
                    Method::from_bytes(rcfg.method.to_uppercase().as_bytes())
                        .wrap_err_with(|| format!("invalid route method {:?}", rcfg.method))?,
                )
            };

            let route = Arc::new(Route {
                path: rcfg.path.clone(),
                method,
                upstreams,
                aggregation: rcfg.aggregation.clone(),
                max_parallel_upstreams: rcfg
                    .max_parallel_upstreams
                    .unwrap_or_else(default_max_parallel_upstreams),
                plugins,
            });

            let pipeline = Arc::new(RoutePipeline {
                route: Arc::clone(&route),
                dispatcher: Arc::clone(&dispatcher),
                aggregator: Aggregator,
            });

            routes.push(RouteEntry {
                route,
                handler: compose(&chain, pipeline),
            });
        }

        let rate_limiter = if cfg.features.ratelimit.enabled {
            Some(Arc::new(RateLimiter::from_config(&cfg.features.ratelimit)?))
        } else {
            None
        };

        Ok(Self {
            routes,
            rate_limiter,
            metrics,
        })
    }

    pub fn rate_limiter(&self) -> Option<&Arc<RateLimiter>> {
        self.rate_limiter.as_ref()
    }

    /// The inbound request pipeline:
    ///
    /// ```text
    /// handle()
    ///  ├─ rate-limit gate (optional feature)
    ///  ├─ match
    ///  ├─ middleware chain
    ///  │   ├─ request-phase plugins
    ///  │   ├─ dispatch
    ///  │   ├─ aggregate
    ///  │   └─ response-phase plugins
    ///  └─ write
    /// ```
    pub async fn handle(&self, mut req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        self.metrics.inc_requests_total();
        self.metrics.inc_requests_in_flight();

        let method = req.method().as_str().to_string();
        let request_id = request_id_for(&req);
        let span = tracing_setup::create_request_span(&method, req.uri().path(), &request_id);

        let (route_label, response) = async {
            if let Some(limiter) = &self.rate_limiter {
                if let Some(ip) = client_ip_of(&req) {
                    if !limiter.allow(ip) {
                        tracing::warn!(uri = %req.uri(), "too many requests");
                        return (
                            String::new(),
                            error_response(
                                StatusCode::TOO_MANY_REQUESTS,
                                ERROR_CODE_RATE_LIMIT_EXCEEDED,
                                "rate limit exceeded",
                                &request_id,
                            ),
                        );
                    }
                }
            }

            let Some(entry) = self.match_route(&req) else {
                tracing::error!(uri = %req.uri(), "no route found");
                self.metrics
                    .inc_failed_requests_total(FailReason::NoMatchedRoute);
                return (String::new(), not_found_response(&request_id));
            };

            req.extensions_mut().insert(RequestId(request_id.clone()));
            let response = entry.handler.call(req).await;
            (entry.route.path.clone(), response)
        }
        .instrument(span)
        .await;

        self.metrics
            .inc_responses_total(&route_label, response.status().as_u16());
        self.metrics
            .observe_request_duration(&route_label, &method, start.elapsed());
        self.metrics.dec_requests_in_flight();

        response
    }

    /// First route whose method matches (case-insensitively, via normalized
    /// `Method`) and whose path equals the request path exactly.
    fn match_route(&self, req: &Request<Body>) -> Option<&RouteEntry> {
        self.routes.iter().find(|entry| {
            let route = &entry.route;
            if let Some(method) = &route.method {
                if method != req.method() {
                    return false;
                }
            }
            route.path == req.uri().path()
        })
    }
}

/// Innermost handler of every route: plugins, dispatch, aggregation and the
/// envelope write.
struct RoutePipeline {
    route: Arc<Route>,
    dispatcher: Arc<Dispatcher>,
    aggregator: Aggregator,
}

#[async_trait]
impl Handler for RoutePipeline {
    async fn call(&self, req: Request<Body>) -> Response<Body> {
        let request_id = req
            .extensions()
            .get::<RequestId>()
            .map(|id| id.0.clone())
            .unwrap_or_else(new_request_id);
        let client_ip = client_ip_of(&req);

        let (parts, body) = req.into_parts();
        let mut ctx = Context::new(parts, request_id.clone());

        // Cancels in-flight upstream work when the client goes away and
        // this future is dropped.
        let cancel = CancellationToken::new();
        let _cancel_guard = cancel.clone().drop_guard();

        // --- 1. Request-phase plugins ---
        for plugin in self.plugins(PluginPhase::Request) {
            tracing::debug!(plugin = plugin.name(), "executing request plugin");

            if let Err(e) = plugin.execute(&mut ctx).await {
                tracing::error!(plugin = plugin.name(), error = %e, "request plugin failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ERROR_CODE_INTERNAL,
                    "internal error",
                    &request_id,
                );
            }

            if let Some(response) = ctx.take_response() {
                tracing::debug!(plugin = plugin.name(), "request plugin short-circuited");
                return write_plugin_response(response, &request_id);
            }
        }

        // --- 2. Dispatch ---
        let Some(responses) = self
            .dispatcher
            .dispatch(&self.route, ctx.request(), body, client_ip, &cancel)
            .await
        else {
            return error_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                ERROR_CODE_PAYLOAD_TOO_LARGE,
                "request body too large",
                &request_id,
            );
        };

        // --- 3. Aggregate ---
        let aggregated = self
            .aggregator
            .aggregate(&responses, &self.route.aggregation, &request_id);

        let status = if aggregated.errors.is_empty() {
            StatusCode::OK
        } else if aggregated.partial {
            StatusCode::PARTIAL_CONTENT
        } else {
            StatusCode::INTERNAL_SERVER_ERROR
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json; charset=utf-8"),
        );
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            headers.insert(HEADER_REQUEST_ID, value);
        }
        overlay_upstream_headers(&mut headers, &responses);

        ctx.set_response(PluginResponse {
            status,
            headers,
            body: envelope_body(aggregated.data.as_deref(), &aggregated.errors),
        });

        // --- 4. Response-phase plugins ---
        for plugin in self.plugins(PluginPhase::Response) {
            tracing::debug!(plugin = plugin.name(), "executing response plugin");

            if let Err(e) = plugin.execute(&mut ctx).await {
                tracing::error!(plugin = plugin.name(), error = %e, "response plugin failed");
                return error_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ERROR_CODE_INTERNAL,
                    "internal error",
                    &request_id,
                );
            }
        }

        // --- 5. Write ---
        match ctx.take_response() {
            Some(response) => write_plugin_response(response, &request_id),
            // set_response above guarantees a response; degrade defensively
            // all the same.
            None => error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                ERROR_CODE_INTERNAL,
                "internal error",
                &request_id,
            ),
        }
    }
}

impl RoutePipeline {
    fn plugins(&self, phase: PluginPhase) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        self.route
            .plugins
            .iter()
            .filter(move |plugin| plugin.phase() == phase)
    }
}

/// Overlay headers from successful upstream responses onto the envelope
/// headers with set semantics (later responses win). Framing headers and
/// `Content-Type` stay as the envelope wrote them.
fn overlay_upstream_headers(headers: &mut HeaderMap, responses: &[UpstreamResponse]) {
    const SKIPPED: [header::HeaderName; 4] = [
        header::CONTENT_TYPE,
        header::CONTENT_LENGTH,
        header::TRANSFER_ENCODING,
        header::CONNECTION,
    ];

    for response in responses.iter().filter(|r| r.err.is_none()) {
        for (name, value) in &response.headers {
            if SKIPPED.contains(name) {
                continue;
            }
            headers.insert(name.clone(), value.clone());
        }
    }
}

fn write_plugin_response(plugin_response: PluginResponse, request_id: &str) -> Response<Body> {
    let mut response = Response::new(Body::from(plugin_response.body));
    *response.status_mut() = plugin_response.status;
    *response.headers_mut() = plugin_response.headers;

    if !response.headers().contains_key(HEADER_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(request_id) {
            response.headers_mut().insert(HEADER_REQUEST_ID, value);
        }
    }

    response
}

/// Reuse the caller's `X-Request-ID` or mint a sortable time-ordered token.
fn request_id_for(req: &Request<Body>) -> String {
    req.headers()
        .get(HEADER_REQUEST_ID)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id)
}

fn new_request_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

fn client_ip_of(req: &Request<Body>) -> Option<IpAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

fn default_max_parallel_upstreams() -> usize {
    2 * std::thread::available_parallelism()
        .map(std::num::NonZeroUsize::get)
        .unwrap_or(1)
}
