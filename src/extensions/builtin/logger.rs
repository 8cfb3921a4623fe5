//! Request logging: a middleware that logs start/completion with latency,
//! and a request-phase plugin logging the matched method and path.
use std::{sync::Arc, time::Instant};

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use hyper::{Request, Response};

use crate::{
    core::context::Context,
    extensions::{
        middleware::{Handler, Middleware},
        plugin::{Plugin, PluginPhase},
        registry::{ExtensionConfig, bool_from},
    },
};

pub fn middleware_factory(cfg: &ExtensionConfig) -> Result<Arc<dyn Middleware>> {
    Ok(Arc::new(LoggerMiddleware {
        enabled: bool_from(cfg, "enabled", true),
    }))
}

pub struct LoggerMiddleware {
    enabled: bool,
}

impl Middleware for LoggerMiddleware {
    fn name(&self) -> &str {
        "logger"
    }

    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        if !self.enabled {
            return next;
        }
        Arc::new(LoggerHandler { next })
    }
}

struct LoggerHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for LoggerHandler {
    async fn call(&self, req: Request<Body>) -> Response<Body> {
        let start = Instant::now();
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        tracing::info!(method = %method, path = %path, "request started");

        let response = self.next.call(req).await;

        tracing::info!(
            method = %method,
            path = %path,
            status = response.status().as_u16(),
            duration_ms = start.elapsed().as_millis() as u64,
            "request completed"
        );

        response
    }
}

pub fn plugin_factory(_cfg: &ExtensionConfig) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(LoggerPlugin))
}

pub struct LoggerPlugin;

#[async_trait]
impl Plugin for LoggerPlugin {
    fn name(&self) -> &str {
        "logger"
    }

    fn phase(&self) -> PluginPhase {
        PluginPhase::Request
    }

    async fn execute(&self, ctx: &mut Context) -> Result<()> {
        tracing::info!(
            method = %ctx.request().method,
            path = ctx.request().uri.path(),
            request_id = ctx.request_id(),
            "request plugin"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Ok200;

    #[async_trait]
    impl Handler for Ok200 {
        async fn call(&self, _req: Request<Body>) -> Response<Body> {
            Response::new(Body::empty())
        }
    }

    #[tokio::test]
    async fn test_disabled_logger_passes_handler_through() {
        let middleware = middleware_factory(&ExtensionConfig::from([(
            "enabled".to_string(),
            serde_json::Value::Bool(false),
        )]))
        .unwrap();

        let handler = middleware.wrap(Arc::new(Ok200));
        let response = handler
            .call(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), hyper::StatusCode::OK);
    }

    #[tokio::test]
    async fn test_enabled_logger_forwards_response() {
        let middleware = middleware_factory(&ExtensionConfig::new()).unwrap();
        let handler = middleware.wrap(Arc::new(Ok200));

        let response = handler
            .call(Request::builder().uri("/x").body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), hyper::StatusCode::OK);
    }
}
