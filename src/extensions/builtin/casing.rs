//! Response-phase plugins transforming top-level JSON field names between
//! camelCase and snake_case.
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use eyre::{Result, eyre};

use crate::{
    core::context::Context,
    extensions::{
        plugin::{Plugin, PluginPhase},
        registry::ExtensionConfig,
    },
};

pub fn snakeify_factory(_cfg: &ExtensionConfig) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(CasingPlugin {
        name: "snakeify",
        transform: camel_to_snake,
    }))
}

pub fn camelify_factory(_cfg: &ExtensionConfig) -> Result<Arc<dyn Plugin>> {
    Ok(Arc::new(CasingPlugin {
        name: "camelify",
        transform: snake_to_camel,
    }))
}

struct CasingPlugin {
    name: &'static str,
    transform: fn(&str) -> String,
}

#[async_trait]
impl Plugin for CasingPlugin {
    fn name(&self) -> &str {
        self.name
    }

    fn phase(&self) -> PluginPhase {
        PluginPhase::Response
    }

    async fn execute(&self, ctx: &mut Context) -> Result<()> {
        let name = self.name;
        let Some(response) = ctx.response_mut() else {
            return Ok(());
        };
        if response.body.is_empty() {
            return Ok(());
        }

        let data: serde_json::Map<String, serde_json::Value> =
            serde_json::from_slice(&response.body)
                .map_err(|e| eyre!("{name}: cannot parse JSON: {e}"))?;

        let transformed: serde_json::Map<String, serde_json::Value> = data
            .into_iter()
            .map(|(key, value)| ((self.transform)(&key), value))
            .collect();

        let body = serde_json::to_vec(&transformed)
            .map_err(|e| eyre!("{name}: cannot serialize JSON: {e}"))?;
        response.body = Bytes::from(body);

        Ok(())
    }
}

fn camel_to_snake(s: &str) -> String {
    let chars: Vec<char> = s.chars().collect();
    let mut out = String::with_capacity(s.len() + 4);

    for (i, &c) in chars.iter().enumerate() {
        if c.is_ascii_uppercase() {
            let prev_lower = i > 0
                && (chars[i - 1].is_ascii_lowercase() || chars[i - 1].is_ascii_digit());
            let next_lower = chars
                .get(i + 1)
                .is_some_and(|next| next.is_ascii_lowercase());
            if i > 0 && (prev_lower || next_lower) {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
        } else {
            out.push(c);
        }
    }

    out
}

fn snake_to_camel(s: &str) -> String {
    let mut parts = s.split('_');
    let mut out = String::with_capacity(s.len());

    if let Some(first) = parts.next() {
        out.push_str(first);
    }
    for part in parts {
        let mut chars = part.chars();
        if let Some(first) = chars.next() {
            out.extend(first.to_uppercase());
            out.extend(chars);
        }
    }

    out
}
