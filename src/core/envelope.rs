//! The JSON response envelope returned to gateway clients.
//!
//! Every response body has the shape `{"data": ..., "errors": ...}` with
//! explicit nulls for the absent half. Error entries carry a stable machine
//! code, a human message and the request id; internal causes never leave the
//! process (they go to the logs instead).
use axum::body::Body;
use bytes::Bytes;
use hyper::{
    Response, StatusCode,
    header::{self, HeaderValue},
};
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

pub const ERROR_CODE_RATE_LIMIT_EXCEEDED: &str = "RATE_LIMIT_EXCEEDED";
pub const ERROR_CODE_PAYLOAD_TOO_LARGE: &str = "PAYLOAD_TOO_LARGE";
pub const ERROR_CODE_UPSTREAM_UNAVAILABLE: &str = "UPSTREAM_UNAVAILABLE";
pub const ERROR_CODE_UPSTREAM_ERROR: &str = "UPSTREAM_ERROR";
pub const ERROR_CODE_UPSTREAM_MALFORMED: &str = "UPSTREAM_MALFORMED";
pub const ERROR_CODE_INTERNAL: &str = "INTERNAL";

pub const HEADER_REQUEST_ID: &str = "X-Request-ID";

/// A single client-facing error entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JsonError {
    pub code: String,
    pub message: String,
    pub request_id: String,
}

impl JsonError {
    pub fn new(code: &str, message: impl Into<String>, request_id: &str) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
            request_id: request_id.to_string(),
        }
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    data: Option<&'a RawValue>,
    errors: Option<&'a [JsonError]>,
}

/// Serialize an envelope body from pre-validated JSON data bytes and a list
/// of errors. Invalid data bytes degrade to `data: null` with a log line
/// rather than corrupting the envelope.
pub fn envelope_body(data: Option<&[u8]>, errors: &[JsonError]) -> Bytes {
    let raw = data.and_then(|bytes| match std::str::from_utf8(bytes) {
        Ok(text) => match RawValue::from_string(text.to_string()) {
            Ok(raw) => Some(raw),
            Err(e) => {
                tracing::error!(error = %e, "aggregated data is not valid JSON");
                None
            }
        },
        Err(e) => {
            tracing::error!(error = %e, "aggregated data is not valid UTF-8");
            None
        }
    });

    let envelope = Envelope {
        data: raw.as_deref(),
        errors: if errors.is_empty() {
            None
        } else {
            Some(errors)
        },
    };

    match serde_json::to_vec(&envelope) {
        Ok(body) => Bytes::from(body),
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize response envelope");
            Bytes::from_static(br#"{"data":null,"errors":null}"#)
        }
    }
}

/// Build a complete envelope response with the default headers.
pub fn envelope_response(
    status: StatusCode,
    data: Option<&[u8]>,
    errors: &[JsonError],
    request_id: &str,
) -> Response<Body> {
    let body = envelope_body(data, errors);

    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }

    response
}

/// Build a single-error envelope response.
pub fn error_response(
    status: StatusCode,
    code: &str,
    message: &str,
    request_id: &str,
) -> Response<Body> {
    envelope_response(
        status,
        None,
        &[JsonError::new(code, message, request_id)],
        request_id,
    )
}

/// The default body for unmatched routes. No envelope here, matching the
/// stdlib-style plain text 404.
pub fn not_found_response(request_id: &str) -> Response<Body> {
    let mut response = Response::new(Body::from("404 page not found\n"));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(HEADER_REQUEST_ID, value);
    }

    response
}
