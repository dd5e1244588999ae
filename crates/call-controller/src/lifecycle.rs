//! Uniform component lifecycle.
//!
//! Every long-lived component (queue manager, matching engine, coordinator,
//! state store) implements [`Component`]. The facade starts them in
//! dependency order and stops them in reverse; background tasks hang off a
//! `CancellationToken` so shutdown is a cancel-then-join, never an abort.

use crate::errors::CallError;
use async_trait::async_trait;

/// Start/stop contract implemented by every core component.
///
/// `start` is idempotent: calling it on a running component is a no-op.
/// `stop` cancels the component's background work and waits for it to
/// drain; it is safe to call on a component that was never started.
#[async_trait]
pub trait Component: Send + Sync {
    /// Short component name for logs.
    fn name(&self) -> &'static str;

    /// Start background work.
    async fn start(&self) -> Result<(), CallError>;

    /// Cancel background work and wait for it to finish.
    async fn stop(&self);
}
