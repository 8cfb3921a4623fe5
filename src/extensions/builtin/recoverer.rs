//! Panic recovery middleware.
//!
//! A panic anywhere inside the wrapped pipeline is caught and turned into
//! `500 {"error": "internal server error"}` so the request fails without
//! taking down the connection task.
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::Body;
use eyre::Result;
use futures_util::FutureExt;
use hyper::{
    Request, Response, StatusCode,
    header::{self, HeaderValue},
};

use crate::extensions::{
    middleware::{Handler, Middleware},
    registry::{ExtensionConfig, bool_from},
};

pub fn factory(cfg: &ExtensionConfig) -> Result<Arc<dyn Middleware>> {
    Ok(Arc::new(RecovererMiddleware {
        enabled: bool_from(cfg, "enabled", true),
    }))
}

pub struct RecovererMiddleware {
    enabled: bool,
}

impl Middleware for RecovererMiddleware {
    fn name(&self) -> &str {
        "recoverer"
    }

    fn wrap(&self, next: Arc<dyn Handler>) -> Arc<dyn Handler> {
        if !self.enabled {
            return next;
        }
        Arc::new(RecovererHandler { next })
    }
}

struct RecovererHandler {
    next: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for RecovererHandler {
    async fn call(&self, req: Request<Body>) -> Response<Body> {
        let method = req.method().clone();
        let path = req.uri().path().to_string();

        match std::panic::AssertUnwindSafe(self.next.call(req))
            .catch_unwind()
            .await
        {
            Ok(response) => response,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    method = %method,
                    path = %path,
                    panic = %message,
                    "panic recovered"
                );

                let mut response =
                    Response::new(Body::from(r#"{"error": "internal server error"}"#));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response.headers_mut().insert(
                    header::CONTENT_TYPE,
                    HeaderValue::from_static("application/json"),
                );
                response
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
