//! Configuration loading, models, and validation.
pub mod loader;
pub mod models;
pub mod validation;

pub use models::{
    AggregationConfig, AggregationStrategy, FeatureConfig, GatewayConfig, MetricsConfig,
    MiddlewareConfig, PluginConfig, PolicyConfig, RateLimitConfig, RouteConfig, RouterConfigSet,
    ServerConfig, UpstreamConfig,
};
pub use validation::{GatewayConfigValidator, ValidationError};
