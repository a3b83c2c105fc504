use async_trait::async_trait;

use crate::context::ModuleCtx;

/// A unit of business logic driven by the registry.
///
/// `uid` is the registry key and the label used in logs and metrics; it must
/// be non-empty and unique. `init` runs in registration order, `exit` and
/// `clean` run in reverse order, every `exit` before any `clean`.
#[async_trait]
pub trait Module: Send + Sync + 'static {
    fn uid(&self) -> String;

    async fn init(&self, ctx: &ModuleCtx) -> anyhow::Result<()>;

    /// Stop accepting work. Events are already gated when this runs.
    async fn exit(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release resources (subscriptions, jobs, handles).
    async fn clean(&self, _ctx: &ModuleCtx) -> anyhow::Result<()> {
        Ok(())
    }
}
