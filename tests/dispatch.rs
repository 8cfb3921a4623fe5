//! Fan-out behavior observed from the upstream side: forwarding rules,
//! single body read, and status/policy handling end to end.
mod common;

use std::sync::{Arc, Mutex};

use axum::{
    body::Body,
    extract::{Query, Request as AxumRequest},
    routing::any,
};
use http_body_util::BodyExt;
use hyper::{Method, Request, StatusCode};
use plexus::config::models::{
    AggregationConfig, AggregationStrategy, RouteConfig, UpstreamConfig,
};

use common::{body_response, gateway, send, spawn_upstream};

fn route(path: &str, method: &str, upstreams: Vec<UpstreamConfig>) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        method: method.to_string(),
        upstreams,
        aggregation: AggregationConfig {
            strategy: AggregationStrategy::Array,
            allow_partial_results: false,
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn post_body_reaches_every_upstream() {
    let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

    let mut hosts = Vec::new();
    for _ in 0..2 {
        let seen = Arc::clone(&seen);
        let host = spawn_upstream(axum::Router::new().route(
            "/",
            any(move |request: AxumRequest| {
                let seen = Arc::clone(&seen);
                async move {
                    let bytes = request
                        .into_body()
                        .collect()
                        .await
                        .expect("read body")
                        .to_bytes();
                    seen.lock()
                        .unwrap()
                        .push(String::from_utf8_lossy(&bytes).to_string());
                    body_response(r#""ok""#)
                }
            }),
        ))
        .await;
        hosts.push(host);
    }

    let upstreams = hosts
        .iter()
        .map(|host| UpstreamConfig {
            hosts: vec![host.clone()],
            timeout: "2s".to_string(),
            ..Default::default()
        })
        .collect();

    let router = gateway(vec![route("/p", "POST", upstreams)]);

    let (status, _, _) = send(
        &router,
        Request::builder()
            .method(Method::POST)
            .uri("http://gw/p")
            .header("Content-Type", "application/json")
            .body(Body::from(r#"{"payload":1}"#))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let bodies = seen.lock().unwrap();
    assert_eq!(bodies.len(), 2);
    for body in bodies.iter() {
        assert_eq!(body, r#"{"payload":1}"#);
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn forwarding_rules_reach_the_upstream() {
    let target = spawn_upstream(axum::Router::new().route(
        "/",
        any(
            |Query(params): Query<std::collections::HashMap<String, String>>,
             request: AxumRequest| async move {
                let foo = params.get("foo").cloned().unwrap_or_default();
                let skipped = params.contains_key("skip");
                let header = request
                    .headers()
                    .get("X-Test")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or_default()
                    .to_string();
                let forwarded_for = request.headers().contains_key("X-Forwarded-For");

                body_response(format!(r#""{foo}-{skipped}-{header}-{forwarded_for}""#))
            },
        ),
    ))
    .await;

    let upstream = UpstreamConfig {
        hosts: vec![target.clone()],
        timeout: "2s".to_string(),
        forward_headers: vec!["X-Test".to_string()],
        forward_query_strings: vec!["foo".to_string()],
        ..Default::default()
    };

    let router = gateway(vec![route("/f", "GET", vec![upstream])]);

    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/f?foo=bar&skip=1")
            .header("X-Test", "baz")
            .header("X-Other", "drop")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    // Single upstream: the raw body is the data payload.
    assert_eq!(body["data"], serde_json::json!("bar-false-baz-true"));
}

#[tokio::test(flavor = "multi_thread")]
async fn status_remap_and_allowed_statuses() {
    let teapot = spawn_upstream(axum::Router::new().route(
        "/",
        any(|| async {
            let mut response = body_response(r#"{"tea":true}"#);
            *response.status_mut() = StatusCode::IM_A_TEAPOT;
            response
        }),
    ))
    .await;

    // Remap 418 -> 200 and only allow 200: the response passes.
    let mut remapped = UpstreamConfig {
        hosts: vec![teapot.clone()],
        timeout: "2s".to_string(),
        ..Default::default()
    };
    remapped.policy.map_status_codes = [(418, 200)].into_iter().collect();
    remapped.policy.allowed_statuses = vec![200];

    let router = gateway(vec![route("/ok", "GET", vec![remapped])]);
    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/ok")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!({"tea": true}));

    // Without the remap the 418 violates the allowed list.
    let mut strict = UpstreamConfig {
        hosts: vec![teapot],
        timeout: "2s".to_string(),
        ..Default::default()
    };
    strict.policy.allowed_statuses = vec![200];

    let router = gateway(vec![route("/strict", "GET", vec![strict])]);
    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/strict")
            .body(Body::empty())
            .unwrap(),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["errors"][0]["code"], "UPSTREAM_ERROR");
}

#[tokio::test(flavor = "multi_thread")]
async fn response_body_limit_is_enforced() {
    let chatty = spawn_upstream(axum::Router::new().route(
        "/",
        any(|| async { body_response(r#"{"way":"too large for the configured limit"}"#) }),
    ))
    .await;

    let mut limited = UpstreamConfig {
        hosts: vec![chatty],
        timeout: "2s".to_string(),
        ..Default::default()
    };
    limited.policy.max_response_body_size = 8;

    let router = gateway(vec![route("/lim", "GET", vec![limited])]);
    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/lim")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    // BodyTooLarge is a request-correctness failure, mapped to INTERNAL.
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["errors"][0]["code"], "INTERNAL");
}
