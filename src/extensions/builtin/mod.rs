//! Built-in middlewares and plugins shipped with the gateway.
pub mod casing;
pub mod logger;
pub mod recoverer;
