use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::NodeContext;

/// A unit of behavior with a start/run/stop lifecycle.
///
/// Hooks take `&self`; nodes keep mutable state behind their own locks or
/// atomics. A node must never be driven by more than one
/// [`NodeRuntime`](crate::NodeRuntime).
#[async_trait]
pub trait Node: Send + Sync + 'static {
    /// Unique name, used for registration and diagnostics.
    fn name(&self) -> &str;

    /// One-shot setup: subscribe, register actions. The node is not
    /// `Running` until this returns `Ok`.
    async fn on_start(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }

    /// Main loop. Must check `cancel` at every suspension point and return
    /// once it fires; the runtime never aborts the task.
    async fn run(&self, _ctx: NodeContext, cancel: CancellationToken) -> anyhow::Result<()> {
        cancel.cancelled().await;
        Ok(())
    }

    /// One-shot teardown, after the loop has returned or been abandoned.
    async fn on_stop(&self, _ctx: &NodeContext) -> anyhow::Result<()> {
        Ok(())
    }
}
