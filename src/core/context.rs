//! Per-request context handed to plugins.
//!
//! Created at pipeline entry, discarded after the response is written.
//! Request-phase plugins may mutate the inbound request head or set a
//! response to short-circuit the pipeline; response-phase plugins edit the
//! response in place. The data bag carries opaque values between plugins.
use std::collections::HashMap;

use bytes::Bytes;
use hyper::{HeaderMap, StatusCode, http::request::Parts};

/// The response under construction, editable by plugins.
#[derive(Debug)]
pub struct PluginResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Per-request carrier for plugin execution.
#[derive(Debug)]
pub struct Context {
    request: Parts,
    response: Option<PluginResponse>,
    data: HashMap<String, serde_json::Value>,
    request_id: String,
}

impl Context {
    pub fn new(request: Parts, request_id: String) -> Self {
        Self {
            request,
            response: None,
            data: HashMap::new(),
            request_id,
        }
    }

    pub fn request(&self) -> &Parts {
        &self.request
    }

    pub fn request_mut(&mut self) -> &mut Parts {
        &mut self.request
    }

    pub fn response(&self) -> Option<&PluginResponse> {
        self.response.as_ref()
    }

    pub fn response_mut(&mut self) -> Option<&mut PluginResponse> {
        self.response.as_mut()
    }

    /// Set (or replace) the response. During the request phase this
    /// short-circuits the pipeline.
    pub fn set_response(&mut self, response: PluginResponse) {
        self.response = Some(response);
    }

    pub fn take_response(&mut self) -> Option<PluginResponse> {
        self.response.take()
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn data(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use hyper::Request;

    use super::*;

    fn parts() -> Parts {
        let (parts, _) = Request::builder()
            .uri("http://gw/test")
            .body(Body::empty())
            .unwrap()
            .into_parts();
        parts
    }

    #[test]
    fn test_data_bag_round_trip() {
        let mut ctx = Context::new(parts(), "req-1".to_string());

        ctx.set_data("auth.subject", serde_json::json!("user-42"));
        assert_eq!(
            ctx.data("auth.subject"),
            Some(&serde_json::json!("user-42"))
        );
        assert!(ctx.data("missing").is_none());
    }

    #[test]
    fn test_short_circuit_response() {
        let mut ctx = Context::new(parts(), "req-2".to_string());
        assert!(ctx.response().is_none());

        ctx.set_response(PluginResponse {
            status: StatusCode::TOO_MANY_REQUESTS,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        });

        let response = ctx.take_response().unwrap();
        assert_eq!(response.status, StatusCode::TOO_MANY_REQUESTS);
        assert!(ctx.response().is_none());
    }
}
