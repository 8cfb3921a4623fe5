use std::path::Path;

use config::{Config, File, FileFormat};
use eyre::{Context, Result};

use crate::config::models::GatewayConfig;

/// Load configuration from a file using the config crate.
/// Supports multiple formats: YAML, JSON, TOML.
pub fn load_config(config_path: &str) -> Result<GatewayConfig> {
    let path = Path::new(config_path);

    // Determine file format based on extension
    let format = match path.extension().and_then(|ext| ext.to_str()) {
        Some("yaml") | Some("yml") => FileFormat::Yaml,
        Some("json") => FileFormat::Json,
        Some("toml") => FileFormat::Toml,
        _ => FileFormat::Yaml, // Default to YAML
    };

    let settings = Config::builder()
        .add_source(File::new(
            path.to_str()
                .ok_or_else(|| eyre::eyre!("Invalid UTF-8 path: {}", path.display()))?,
            format,
        ))
        .build()
        .with_context(|| format!("Failed to build config from {}", path.display()))?;

    let mut gateway_config: GatewayConfig = settings.try_deserialize().with_context(|| {
        format!("Failed to deserialize config from {}", path.display())
    })?;

    for route in &mut gateway_config.routes {
        route.upstreams = route
            .upstreams
            .drain(..)
            .map(|upstream| upstream.normalized())
            .collect();
    }

    Ok(gateway_config)
}
