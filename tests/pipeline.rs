//! End-to-end pipeline scenarios against real ephemeral-port upstreams.
mod common;

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use axum::{body::Body, routing::any};
use hyper::{Method, Request, StatusCode};
use plexus::config::models::{
    AggregationConfig, AggregationStrategy, RouteConfig, UpstreamConfig,
};

use common::{body_response, gateway, send, spawn_upstream};

fn upstream(host: &str) -> UpstreamConfig {
    UpstreamConfig {
        hosts: vec![host.to_string()],
        timeout: "2s".to_string(),
        ..Default::default()
    }
}

fn route(
    path: &str,
    method: &str,
    upstreams: Vec<UpstreamConfig>,
    strategy: AggregationStrategy,
    allow_partial: bool,
) -> RouteConfig {
    RouteConfig {
        path: path.to_string(),
        method: method.to_string(),
        upstreams,
        aggregation: AggregationConfig {
            strategy,
            allow_partial_results: allow_partial,
        },
        ..Default::default()
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_happy_path() {
    let first = spawn_upstream(axum::Router::new().route(
        "/",
        any(|| async { body_response(r#"{"a":1,"b":2}"#) }),
    ))
    .await;
    let second = spawn_upstream(axum::Router::new().route(
        "/",
        any(|| async { body_response(r#"{"b":3,"c":4}"#) }),
    ))
    .await;

    let router = gateway(vec![route(
        "/m",
        "GET",
        vec![upstream(&first), upstream(&second)],
        AggregationStrategy::Merge,
        false,
    )]);

    let (status, headers, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/m")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(headers.contains_key("X-Request-ID"));
    assert_eq!(body["data"], serde_json::json!({"a": 1, "b": 3, "c": 4}));
    assert!(body["errors"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn merge_with_malformed_upstream_partial_allowed() {
    let good = spawn_upstream(axum::Router::new().route(
        "/",
        any(|| async { body_response(r#"{"a":1}"#) }),
    ))
    .await;
    let bad = spawn_upstream(
        axum::Router::new().route("/", any(|| async { body_response("not json") })),
    )
    .await;

    let router = gateway(vec![route(
        "/m",
        "GET",
        vec![upstream(&good), upstream(&bad)],
        AggregationStrategy::Merge,
        true,
    )]);

    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/m")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::PARTIAL_CONTENT);
    assert_eq!(body["data"], serde_json::json!({"a": 1}));
    assert_eq!(body["errors"][0]["code"], "UPSTREAM_MALFORMED");
}

#[tokio::test(flavor = "multi_thread")]
async fn array_with_timeout_partial_disallowed() {
    let fast = spawn_upstream(
        axum::Router::new().route("/", any(|| async { body_response(r#""A""#) })),
    )
    .await;
    let slow = spawn_upstream(axum::Router::new().route(
        "/",
        any(|| async {
            tokio::time::sleep(Duration::from_millis(300)).await;
            body_response(r#""too slow""#)
        }),
    ))
    .await;

    let mut slow_upstream = upstream(&slow);
    slow_upstream.timeout = "50ms".to_string();

    let router = gateway(vec![route(
        "/a",
        "GET",
        vec![upstream(&fast), slow_upstream],
        AggregationStrategy::Array,
        false,
    )]);

    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/a")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["data"].is_null());
    assert_eq!(body["errors"][0]["code"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(body["errors"][0]["message"], "service temporarily unavailable");
}

#[tokio::test(flavor = "multi_thread")]
async fn oversized_body_is_rejected_without_upstream_calls() {
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_clone = Arc::clone(&hits);

    let target = spawn_upstream(axum::Router::new().route(
        "/",
        any(move || {
            let hits = Arc::clone(&hits_clone);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                body_response("{}")
            }
        }),
    ))
    .await;

    let router = gateway(vec![route(
        "/x",
        "POST",
        vec![upstream(&target)],
        AggregationStrategy::Merge,
        false,
    )]);

    let six_mib = vec![b'x'; 6 * 1024 * 1024];
    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::POST)
            .uri("http://gw/x")
            .body(Body::from(six_mib))
            .unwrap(),
    )
    .await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["errors"][0]["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let attempts_clone = Arc::clone(&attempts);

    let flaky = spawn_upstream(axum::Router::new().route(
        "/",
        any(move || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    let mut response = body_response("transient");
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    response
                } else {
                    body_response(r#"{"ok":true}"#)
                }
            }
        }),
    ))
    .await;

    let mut flaky_upstream = upstream(&flaky);
    flaky_upstream.policy.retry.max_retries = 3;
    flaky_upstream.policy.retry.retry_on_statuses = vec![500];
    flaky_upstream.policy.retry.backoff_delay = "10ms".to_string();

    let router = gateway(vec![route(
        "/r",
        "GET",
        vec![flaky_upstream],
        AggregationStrategy::Merge,
        false,
    )]);

    let (status, _, body) = send(
        &router,
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/r")
            .body(Body::empty())
            .unwrap(),
    )
    .await;

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!({"ok": true}));
}

#[tokio::test(flavor = "multi_thread")]
async fn circuit_breaker_opens_then_half_opens() {
    let healthy = Arc::new(AtomicBool::new(false));
    let hits = Arc::new(AtomicUsize::new(0));
    let healthy_clone = Arc::clone(&healthy);
    let hits_clone = Arc::clone(&hits);

    let target = spawn_upstream(axum::Router::new().route(
        "/",
        any(move || {
            let healthy = Arc::clone(&healthy_clone);
            let hits = Arc::clone(&hits_clone);
            async move {
                hits.fetch_add(1, Ordering::SeqCst);
                if healthy.load(Ordering::SeqCst) {
                    body_response(r#"{"ok":true}"#)
                } else {
                    let mut response = body_response("down");
                    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                    response
                }
            }
        }),
    ))
    .await;

    let mut guarded = upstream(&target);
    guarded.policy.circuit_breaker.enabled = true;
    guarded.policy.circuit_breaker.max_failures = 2;
    guarded.policy.circuit_breaker.reset_timeout = "100ms".to_string();

    let router = gateway(vec![route(
        "/b",
        "GET",
        vec![guarded],
        AggregationStrategy::Merge,
        false,
    )]);

    let request = || {
        Request::builder()
            .method(Method::GET)
            .uri("http://gw/b")
            .body(Body::empty())
            .unwrap()
    };

    // Two failing requests trip the breaker.
    for _ in 0..2 {
        let (status, _, body) = send(&router, request()).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["errors"][0]["code"], "UPSTREAM_ERROR");
    }
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // Open breaker: denied without an outbound call.
    let (status, _, body) = send(&router, request()).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["errors"][0]["code"], "UPSTREAM_UNAVAILABLE");
    assert_eq!(hits.load(Ordering::SeqCst), 2);

    // After the reset timeout the probe goes through and closes the breaker.
    healthy.store(true, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(120)).await;

    let (status, _, body) = send(&router, request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], serde_json::json!({"ok": true}));
    assert_eq!(hits.load(Ordering::SeqCst), 3);

    let (status, _, _) = send(&router, request()).await;
    assert_eq!(status, StatusCode::OK);
}
