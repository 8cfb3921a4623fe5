//! Configuration validation.
//!
//! The validator runs before the router is built and accumulates every
//! problem it finds, so an operator sees the full list at once. The core
//! assumes a validated configuration: unknown aggregation strategies, empty
//! upstream lists and out-of-range status codes never reach it.
use hyper::Method;

use crate::config::models::{
    AggregationStrategy, GatewayConfig, PolicyConfig, RateLimitConfig, RouteConfig,
};

/// Validation result type alias
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Validation error types
#[derive(Debug, thiserror::Error, Clone)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Validation failed: {message}")]
    ValidationFailed { message: String },
}

/// Gateway configuration validator
pub struct GatewayConfigValidator;

impl GatewayConfigValidator {
    /// Validate the entire gateway configuration
    pub fn validate(config: &GatewayConfig) -> ValidationResult<()> {
        let mut errors = Vec::new();

        if config.routes.is_empty() {
            errors.push(ValidationError::MissingField {
                field: "routes".to_string(),
            });
        }

        for route in &config.routes {
            if let Err(mut route_errors) = Self::validate_route(route) {
                errors.append(&mut route_errors);
            }
        }

        if config.features.ratelimit.enabled {
            if let Err(e) = Self::validate_rate_limit(&config.features.ratelimit) {
                errors.push(e);
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::ValidationFailed {
                message: Self::format_multiple_errors(errors),
            })
        }
    }

    fn validate_route(route: &RouteConfig) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();
        let path = &route.path;

        if !path.starts_with('/') {
            errors.push(ValidationError::InvalidField {
                field: format!("route path: {path}"),
                message: "Route paths must start with '/'".to_string(),
            });
        }

        if !route.method.is_empty()
            && Method::from_bytes(route.method.to_uppercase().as_bytes()).is_err()
        {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' method"),
                message: format!("Invalid HTTP method: '{}'", route.method),
            });
        }

        if route.upstreams.is_empty() {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' upstreams"),
                message: "Routes must have at least one upstream".to_string(),
            });
        }

        if route.aggregation.strategy == AggregationStrategy::Unknown {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' aggregation.strategy"),
                message: "Unknown aggregation strategy; use 'merge' or 'array'".to_string(),
            });
        }

        if route.max_parallel_upstreams == Some(0) {
            errors.push(ValidationError::InvalidField {
                field: format!("route '{path}' max_parallel_upstreams"),
                message: "Fan-out parallelism must be greater than 0".to_string(),
            });
        }

        for (i, upstream) in route.upstreams.iter().enumerate() {
            let context = format!("route '{path}' upstream {}", i + 1);

            if upstream.hosts.is_empty() {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} hosts"),
                    message: "Upstreams must have at least one host".to_string(),
                });
            }

            for host in &upstream.hosts {
                if !host.starts_with("http://") && !host.starts_with("https://") {
                    errors.push(ValidationError::InvalidField {
                        field: format!("{context} hosts"),
                        message: format!(
                            "Host URL must start with http:// or https://, got: {host}"
                        ),
                    });
                }
            }

            if !upstream.method.is_empty()
                && Method::from_bytes(upstream.method.to_uppercase().as_bytes()).is_err()
            {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} method"),
                    message: format!("Invalid HTTP method: '{}'", upstream.method),
                });
            }

            if let Err(e) = Self::validate_duration(&upstream.timeout, &format!("{context} timeout"))
            {
                errors.push(e);
            }

            if let Err(mut policy_errors) = Self::validate_policy(&upstream.policy, &context) {
                errors.append(&mut policy_errors);
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_policy(policy: &PolicyConfig, context: &str) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        let status_fields = [
            (&policy.allowed_statuses, "policy.allowed_statuses"),
            (&policy.retry.retry_on_statuses, "policy.retry.retry_on_statuses"),
        ];
        for (statuses, field) in status_fields {
            for status in statuses {
                if let Err(e) = Self::validate_status_code(*status, &format!("{context} {field}")) {
                    errors.push(e);
                }
            }
        }

        for (from, to) in &policy.map_status_codes {
            for status in [*from, *to] {
                if let Err(e) =
                    Self::validate_status_code(status, &format!("{context} policy.map_status_codes"))
                {
                    errors.push(e);
                }
            }
        }

        if let Err(e) = Self::validate_duration(
            &policy.retry.backoff_delay,
            &format!("{context} policy.retry.backoff_delay"),
        ) {
            errors.push(e);
        }

        if policy.circuit_breaker.enabled {
            if policy.circuit_breaker.max_failures == 0 {
                errors.push(ValidationError::InvalidField {
                    field: format!("{context} policy.circuit_breaker.max_failures"),
                    message: "Breaker failure threshold must be greater than 0".to_string(),
                });
            }
            if let Err(e) = Self::validate_duration(
                &policy.circuit_breaker.reset_timeout,
                &format!("{context} policy.circuit_breaker.reset_timeout"),
            ) {
                errors.push(e);
            }
        }

        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }

    fn validate_rate_limit(config: &RateLimitConfig) -> ValidationResult<()> {
        if config.limit == 0 {
            return Err(ValidationError::InvalidField {
                field: "features.ratelimit.limit".to_string(),
                message: "Rate limit must be greater than 0".to_string(),
            });
        }

        Self::validate_duration(&config.window, "features.ratelimit.window")
    }

    fn validate_status_code(status: u16, context: &str) -> ValidationResult<()> {
        if !(100..=599).contains(&status) {
            return Err(ValidationError::InvalidField {
                field: context.to_string(),
                message: format!("Status code {status} is out of range (100-599)"),
            });
        }
        Ok(())
    }

    fn validate_duration(value: &str, context: &str) -> ValidationResult<()> {
        humantime::parse_duration(value).map_err(|e| ValidationError::InvalidField {
            field: context.to_string(),
            message: format!("Invalid duration '{value}': {e}"),
        })?;
        Ok(())
    }

    /// Format multiple validation errors into a single message
    fn format_multiple_errors(errors: Vec<ValidationError>) -> String {
        if errors.len() == 1 {
            return errors[0].to_string();
        }

        let mut message = format!("Found {} validation errors:\n", errors.len());
        for (i, error) in errors.iter().enumerate() {
            message.push_str(&format!("  {}. {}\n", i + 1, error));
        }
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::models::{AggregationConfig, UpstreamConfig};

    fn valid_config() -> GatewayConfig {
        GatewayConfig {
            routes: vec![RouteConfig {
                path: "/m".to_string(),
                method: "GET".to_string(),
                upstreams: vec![
                    UpstreamConfig {
                        hosts: vec!["http://a:8080".to_string()],
                        ..Default::default()
                    }
                    .normalized(),
                ],
                aggregation: AggregationConfig::default(),
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(GatewayConfigValidator::validate(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_routes_rejected() {
        let config = GatewayConfig::default();
        assert!(GatewayConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_empty_upstreams_rejected() {
        let mut config = valid_config();
        config.routes[0].upstreams.clear();

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("at least one upstream"));
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let mut config = valid_config();
        config.routes[0].aggregation.strategy = AggregationStrategy::Unknown;

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("aggregation.strategy"));
    }

    #[test]
    fn test_out_of_range_status_rejected() {
        let mut config = valid_config();
        config.routes[0].upstreams[0]
            .policy
            .allowed_statuses
            .push(700);

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("out of range"));
    }

    #[test]
    fn test_bad_duration_rejected() {
        let mut config = valid_config();
        config.routes[0].upstreams[0].timeout = "soon".to_string();

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("Invalid duration"));
    }

    #[test]
    fn test_multiple_errors_accumulate() {
        let mut config = valid_config();
        config.routes[0].path = "no-slash".to_string();
        config.routes[0].method = "NOT A METHOD".to_string();
        config.routes[0].upstreams[0].hosts = vec!["ftp://a".to_string()];

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("validation errors"));
    }

    #[test]
    fn test_breaker_threshold_rejected_when_zero() {
        let mut config = valid_config();
        config.routes[0].upstreams[0].policy.circuit_breaker.enabled = true;
        config.routes[0].upstreams[0]
            .policy
            .circuit_breaker
            .max_failures = 0;

        let err = GatewayConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("failure threshold"));
    }
}
