//! Response aggregation.
//!
//! Combines the dispatcher's upstream responses into one envelope payload.
//! `merge` shallow-merges JSON objects (later responses win on key
//! collisions), `array` collects bodies into a JSON array in input order.
//! Upstream errors map to client error codes here and nowhere else; the
//! `allow_partial_results` flag decides between failing fast and collecting
//! errors alongside the surviving data.
use serde_json::{Map, Value};

use crate::{
    config::models::{AggregationConfig, AggregationStrategy},
    core::{
        envelope::{
            ERROR_CODE_INTERNAL, ERROR_CODE_UPSTREAM_ERROR, ERROR_CODE_UPSTREAM_MALFORMED,
            ERROR_CODE_UPSTREAM_UNAVAILABLE, JsonError,
        },
        upstream::{UpstreamError, UpstreamErrorKind, UpstreamResponse},
    },
};

/// The combined result of one fan-out.
#[derive(Debug, Default)]
pub struct AggregatedResponse {
    /// Serialized JSON payload, when any upstream produced usable data.
    pub data: Option<Vec<u8>>,
    pub errors: Vec<JsonError>,
    /// Set when data and errors coexist; drives the 206 status.
    pub partial: bool,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct Aggregator;

impl Aggregator {
    pub fn aggregate(
        &self,
        responses: &[UpstreamResponse],
        cfg: &AggregationConfig,
        request_id: &str,
    ) -> AggregatedResponse {
        if responses.len() == 1 {
            return self.single(&responses[0], request_id);
        }

        match cfg.strategy {
            AggregationStrategy::Merge => {
                self.merge(responses, cfg.allow_partial_results, request_id)
            }
            AggregationStrategy::Array => {
                self.array(responses, cfg.allow_partial_results, request_id)
            }
            AggregationStrategy::Unknown => {
                // Validation rejects unknown strategies before the router is
                // built; degrade to an empty envelope if one slips through.
                tracing::error!("unknown aggregation strategy");
                AggregatedResponse::default()
            }
        }
    }

    /// Fast path for single-upstream routes; the strategy is ignored.
    fn single(&self, response: &UpstreamResponse, request_id: &str) -> AggregatedResponse {
        if let Some(err) = &response.err {
            return AggregatedResponse {
                errors: vec![map_upstream_error(err, request_id)],
                ..Default::default()
            };
        }

        if response.body.is_empty() {
            return AggregatedResponse::default();
        }

        if serde_json::from_slice::<&serde_json::value::RawValue>(&response.body).is_err() {
            return AggregatedResponse {
                errors: vec![JsonError::new(
                    ERROR_CODE_UPSTREAM_MALFORMED,
                    "upstream malformed",
                    request_id,
                )],
                ..Default::default()
            };
        }

        AggregatedResponse {
            data: Some(response.body.to_vec()),
            ..Default::default()
        }
    }

    fn merge(
        &self,
        responses: &[UpstreamResponse],
        allow_partial: bool,
        request_id: &str,
    ) -> AggregatedResponse {
        let mut accumulator = Map::new();
        let mut errors = Vec::new();

        for response in responses {
            if let Some(err) = &response.err {
                let mapped = map_upstream_error(err, request_id);
                if !allow_partial {
                    return fail_fast(mapped);
                }
                errors.push(mapped);
                continue;
            }

            match serde_json::from_slice::<Map<String, Value>>(&response.body) {
                Ok(object) => {
                    // Later responses overwrite earlier ones on collision.
                    for (key, value) in object {
                        accumulator.insert(key, value);
                    }
                }
                Err(e) => {
                    tracing::debug!(error = %e, "upstream body is not a JSON object");
                    let malformed = JsonError::new(
                        ERROR_CODE_UPSTREAM_MALFORMED,
                        "upstream malformed",
                        request_id,
                    );
                    if !allow_partial {
                        return fail_fast(malformed);
                    }
                    errors.push(malformed);
                }
            }
        }

        finalize(serde_json::to_vec(&accumulator), errors)
    }

    fn array(
        &self,
        responses: &[UpstreamResponse],
        allow_partial: bool,
        request_id: &str,
    ) -> AggregatedResponse {
        let mut items = Vec::with_capacity(responses.len());
        let mut errors = Vec::new();

        for response in responses {
            if let Some(err) = &response.err {
                let mapped = map_upstream_error(err, request_id);
                if !allow_partial {
                    return fail_fast(mapped);
                }
                errors.push(mapped);
                continue;
            }

            match serde_json::from_slice::<Value>(&response.body) {
                Ok(value) => items.push(value),
                Err(e) => {
                    tracing::debug!(error = %e, "upstream body is not valid JSON");
                    let malformed = JsonError::new(
                        ERROR_CODE_UPSTREAM_MALFORMED,
                        "upstream malformed",
                        request_id,
                    );
                    if !allow_partial {
                        return fail_fast(malformed);
                    }
                    errors.push(malformed);
                }
            }
        }

        finalize(serde_json::to_vec(&items), errors)
    }
}

fn fail_fast(error: JsonError) -> AggregatedResponse {
    AggregatedResponse {
        data: None,
        errors: vec![error],
        partial: false,
    }
}

fn finalize(
    data: Result<Vec<u8>, serde_json::Error>,
    errors: Vec<JsonError>,
) -> AggregatedResponse {
    let data = match data {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            tracing::error!(error = %e, "cannot serialize aggregated data");
            None
        }
    };

    let errors = dedupe_by_code(errors);
    let partial = !errors.is_empty();

    AggregatedResponse {
        data,
        errors,
        partial,
    }
}

/// Keep the first error of each code, preserving order.
fn dedupe_by_code(errors: Vec<JsonError>) -> Vec<JsonError> {
    let mut seen = std::collections::HashSet::new();
    errors
        .into_iter()
        .filter(|error| seen.insert(error.code.clone()))
        .collect()
}

fn map_upstream_error(err: &UpstreamError, request_id: &str) -> JsonError {
    let (code, message) = match err.kind {
        UpstreamErrorKind::Timeout
        | UpstreamErrorKind::Connection
        | UpstreamErrorKind::CircuitOpen => (
            ERROR_CODE_UPSTREAM_UNAVAILABLE,
            "service temporarily unavailable",
        ),
        UpstreamErrorKind::BadStatus => (ERROR_CODE_UPSTREAM_ERROR, "upstream error"),
        _ => (ERROR_CODE_INTERNAL, "internal error"),
    };

    JsonError::new(code, message, request_id)
}
