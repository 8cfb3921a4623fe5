//! Extension factory registry.
//!
//! An explicit value constructed at startup and threaded through the router
//! builder; there is no process-global registration. Built-ins are
//! pre-registered by [`ExtensionRegistry::with_builtins`]; embedders add
//! their own factories before building the router.
use std::{collections::HashMap, sync::Arc};

use eyre::{Result, eyre};
use serde_json::Value;

use crate::{
    config::models::{MiddlewareConfig, PluginConfig},
    extensions::{
        builtin,
        middleware::Middleware,
        plugin::Plugin,
    },
};

pub type ExtensionConfig = HashMap<String, Value>;
pub type MiddlewareFactory = fn(&ExtensionConfig) -> Result<Arc<dyn Middleware>>;
pub type PluginFactory = fn(&ExtensionConfig) -> Result<Arc<dyn Plugin>>;

#[derive(Default)]
pub struct ExtensionRegistry {
    middlewares: HashMap<String, MiddlewareFactory>,
    plugins: HashMap<String, PluginFactory>,
}

impl ExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with every built-in extension pre-registered.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_middleware("logger", builtin::logger::middleware_factory);
        registry.register_middleware("recoverer", builtin::recoverer::factory);
        registry.register_plugin("logger", builtin::logger::plugin_factory);
        registry.register_plugin("snakeify", builtin::casing::snakeify_factory);
        registry.register_plugin("camelify", builtin::casing::camelify_factory);
        registry
    }

    pub fn register_middleware(&mut self, name: &str, factory: MiddlewareFactory) {
        self.middlewares.insert(name.to_string(), factory);
    }

    pub fn register_plugin(&mut self, name: &str, factory: PluginFactory) {
        self.plugins.insert(name.to_string(), factory);
    }

    /// Instantiate and initialize a middleware from its route configuration.
    pub fn create_middleware(&self, cfg: &MiddlewareConfig) -> Result<Arc<dyn Middleware>> {
        let factory = self
            .middlewares
            .get(&cfg.name)
            .ok_or_else(|| eyre!("unknown middleware {:?}", cfg.name))?;
        factory(&cfg.config)
    }

    /// Instantiate and initialize a plugin from its route configuration.
    pub fn create_plugin(&self, cfg: &PluginConfig) -> Result<Arc<dyn Plugin>> {
        let factory = self
            .plugins
            .get(&cfg.name)
            .ok_or_else(|| eyre!("unknown plugin {:?}", cfg.name))?;
        factory(&cfg.config)
    }
}

/// Read a boolean key from an extension config map, defaulting when absent
/// or mistyped.
pub(crate) fn bool_from(cfg: &ExtensionConfig, key: &str, default: bool) -> bool {
    cfg.get(key).and_then(Value::as_bool).unwrap_or(default)
}
