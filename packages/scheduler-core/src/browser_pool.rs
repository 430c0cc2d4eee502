//! Browser pool collaborator (§6.1) — named interface only.
//!
//! Out of scope for this crate: allocating, authenticating and recycling
//! headless-browser sessions against the ERP is owned by whatever deployment
//! embeds this scheduler. The core only needs the four operations below.

use async_trait::async_trait;

use crate::ids::UserId;

/// An opaque, authenticated session handle bound to one agent. Consumed
/// exclusively by a single handler invocation; the core never inspects its
/// contents.
#[derive(Debug, Clone)]
pub struct ContextHandle(pub String);

/// Allocates and recycles authenticated browser contexts, one per agent.
#[async_trait]
pub trait BrowserPool: Send + Sync {
    /// Returns an authenticated, reusable context bound to `user_id`.
    /// Failures propagate to the processor as a handler failure
    /// ([`crate::error::SchedulerError::ContextAcquisition`]).
    async fn acquire_context(
        &self,
        user_id: UserId,
        from_queue: bool,
    ) -> anyhow::Result<ContextHandle>;

    /// Always paired with an `acquire_context`; `success = false` signals
    /// the pool the context may be poisoned and should not be reused
    /// as-is.
    async fn release_context(&self, user_id: UserId, handle: ContextHandle, success: bool);

    /// Optional hint: the agent's context is about to be used outside the
    /// scheduler's own admission path (e.g. a synchronous API call).
    async fn mark_in_use(&self, _user_id: UserId) {}

    /// Optional hint: the agent's context is free again.
    async fn mark_idle(&self, _user_id: UserId) {}
}
