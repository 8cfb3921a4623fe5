//! Plugin contract.
//!
//! Plugins run inside the route pipeline with access to the per-request
//! [`Context`]: request-phase plugins before dispatch (they may mutate the
//! outbound request head or short-circuit by setting a response), response-
//! phase plugins after aggregation (they may edit headers or body). A
//! plugin returning an error fails the request with `500 INTERNAL`.
use async_trait::async_trait;
use eyre::Result;

use crate::core::context::Context;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginPhase {
    /// Runs before dispatch. JWT checks, request shaping, rate limits.
    Request,
    /// Runs after aggregation. Transforms, masking, response logging.
    Response,
}

#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;
    fn phase(&self) -> PluginPhase;
    async fn execute(&self, ctx: &mut Context) -> Result<()>;
}
