//! Shared helpers for integration tests: ephemeral upstream servers and a
//! gateway router wired to them.
use std::{net::SocketAddr, sync::Arc};

use axum::body::Body;
use http_body_util::BodyExt;
use hyper::{Request, Response};
use plexus::{
    ExtensionRegistry, Router,
    adapters::HttpClientAdapter,
    config::models::{FeatureConfig, RouteConfig, RouterConfigSet},
    metrics::NopMetrics,
};

/// Serve an axum app on an ephemeral port, returning its base URL.
pub async fn spawn_upstream(app: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral port");
    let addr = listener.local_addr().expect("local addr");

    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve upstream");
    });

    format!("http://{addr}")
}

/// Build a gateway router over the given routes with the real HTTP client.
pub fn gateway(routes: Vec<RouteConfig>) -> Router {
    Router::new(
        RouterConfigSet {
            routes,
            middlewares: Vec::new(),
            features: FeatureConfig::default(),
            metrics: Default::default(),
        },
        &ExtensionRegistry::with_builtins(),
        Arc::new(HttpClientAdapter::new().expect("http client")),
        NopMetrics::shared(),
    )
    .expect("router build")
}

/// Drive one request through the gateway and decode the JSON envelope.
pub async fn send(
    router: &Router,
    request: Request<Body>,
) -> (hyper::StatusCode, hyper::HeaderMap, serde_json::Value) {
    let response = router.handle(with_peer(request)).await;
    let (parts, body) = response.into_parts();
    let bytes = body.collect().await.expect("collect body").to_bytes();
    let value = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (parts.status, parts.headers, value)
}

/// Attach a fake peer address, as the connect-info layer would.
pub fn with_peer(mut request: Request<Body>) -> Request<Body> {
    request
        .extensions_mut()
        .insert(axum::extract::ConnectInfo(SocketAddr::from((
            [127, 0, 0, 1],
            54321,
        ))));
    request
}

/// Plain-body response helper for upstream handlers.
pub fn body_response(body: impl Into<Body>) -> Response<Body> {
    Response::new(body.into())
}
