//! Extension contracts: middlewares wrap the route pipeline, plugins run
//! inside it, and the registry maps configured names to factories.
pub mod builtin;
pub mod middleware;
pub mod plugin;
pub mod registry;

pub use middleware::{Handler, Middleware, compose};
pub use plugin::{Plugin, PluginPhase};
pub use registry::{ExtensionConfig, ExtensionRegistry};
