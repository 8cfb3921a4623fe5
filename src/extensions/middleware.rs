//! Middleware and handler contracts.
//!
//! A [`Handler`] is one step of the per-route pipeline; a [`Middleware`]
//! wraps a handler to produce a new one and may short-circuit (authn,
//! panic recovery, etc.). Chains are composed once at route-build time so
//! the first configured middleware ends up outermost.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use hyper::{Request, Response};

/// An async request handler. The innermost handler of every route runs the
/// dispatch pipeline; middlewares stack on top of it.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, req: Request<Body>) -> Response<Body>;
}

/// User code wrapping the per-route pipeline.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    /// Produce a new handler wrapping `next`. Implementations may skip the
    /// inner handler entirely to short-circuit the request.
    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler>;
}

/// Compose a middleware chain around the innermost handler so that the
/// first middleware in the list is the outermost caller.
pub fn compose(middlewares: &[Arc<dyn Middleware>], innermost: Arc<dyn Handler>) -> Arc<dyn Handler> {
    let mut handler = innermost;
    for middleware in middlewares.iter().rev() {
        handler = middleware.wrap(handler);
    }
    handler
}
