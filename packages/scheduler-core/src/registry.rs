//! Handler registry (§6.4, §9 "heterogeneous handler table -> interface +
//! registry").
//!
//! A handler is an opaque async function with the signature of §6.4:
//! `(context, data, userId, onProgress, signal, onEmit) -> result`. The
//! registry maps each [`OperationKind`] to one such function, validated at
//! startup against the full operation registry — a missing kind is a
//! boot-time error here rather than surfacing only when a job of that kind
//! happens to be dequeued, per the redesign flag.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::broadcast::BroadcastChannel;
use crate::browser_pool::ContextHandle;
use crate::events::{BroadcastEvent, CustomEvent, JobEvent};
use crate::ids::{JobId, UserId};
use crate::operation::OperationKind;
use crate::queue::JobQueue;

/// `onProgress(progress, label?)`: updates the queue's per-job progress
/// field and broadcasts `JOB_PROGRESS` (§4.3.4).
#[derive(Clone)]
pub struct ProgressReporter {
    queue: Arc<dyn JobQueue>,
    broadcast: Arc<dyn BroadcastChannel>,
    user_id: UserId,
    job_id: JobId,
    operation_kind: OperationKind,
}

impl ProgressReporter {
    pub(crate) fn new(
        queue: Arc<dyn JobQueue>,
        broadcast: Arc<dyn BroadcastChannel>,
        user_id: UserId,
        job_id: JobId,
        operation_kind: OperationKind,
    ) -> Self {
        Self {
            queue,
            broadcast,
            user_id,
            job_id,
            operation_kind,
        }
    }

    /// `progress` is 0-100. Queue-field update failures are logged and
    /// swallowed — a stalled progress bar must never fail the job.
    pub async fn report(&self, progress: u8, label: Option<String>) {
        if let Err(e) = self
            .queue
            .set_progress(self.job_id, progress, label.clone())
            .await
        {
            tracing::warn!(job_id = %self.job_id, error = %e, "failed to persist job progress");
        }

        let event = JobEvent::Progress {
            job_id: self.job_id,
            operation_kind: self.operation_kind,
            progress,
            label,
        }
        .into_broadcast(chrono::Utc::now());
        self.broadcast.broadcast(self.user_id, event).await;
    }
}

/// `onEmit(event)`: a pass-through escape hatch for handlers to broadcast
/// arbitrary well-formed events without knowing the broadcaster's identity
/// (§4.3.4).
#[derive(Clone)]
pub struct EventEmitter {
    broadcast: Arc<dyn BroadcastChannel>,
    user_id: UserId,
}

impl EventEmitter {
    pub(crate) fn new(broadcast: Arc<dyn BroadcastChannel>, user_id: UserId) -> Self {
        Self { broadcast, user_id }
    }

    pub async fn emit(&self, event_type: impl Into<String>, payload: Value) {
        let event = CustomEvent {
            event_type: event_type.into(),
            payload,
        }
        .into_broadcast(chrono::Utc::now());
        self.emit_broadcast(event).await;
    }

    pub(crate) async fn emit_broadcast(&self, event: BroadcastEvent) {
        self.broadcast.broadcast(self.user_id, event).await;
    }
}

/// Everything a handler invocation needs (§6.4).
pub struct HandlerArgs {
    pub context: ContextHandle,
    pub data: Value,
    pub user_id: UserId,
    pub job_id: JobId,
    pub progress: ProgressReporter,
    pub signal: CancellationToken,
    pub emit: EventEmitter,
}

/// The opaque result a handler returns. The convention `{ success: false,
/// error }` is interpreted by the processor as a logical failure (§6.4,
/// §4.3.2 step 10); anything else is a success payload.
pub type HandlerOutput = Value;

pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<HandlerOutput>> + Send>>;

/// A boxed, type-erased handler. Built from any `Fn(HandlerArgs) -> Fut`
/// via [`HandlerRegistry::register`].
pub type Handler = Arc<dyn Fn(HandlerArgs) -> HandlerFuture + Send + Sync>;

/// Maps each [`OperationKind`] to its registered handler (§6.4, §9
/// redesign flag "explicit registry of `(Kind, Handler)` pairs"). Cheap
/// to clone — internally an `Arc`-backed map once built.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<OperationKind, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` as the handler for `kind`, overwriting any prior
    /// registration.
    pub fn register<F, Fut>(&mut self, kind: OperationKind, f: F) -> &mut Self
    where
        F: Fn(HandlerArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<HandlerOutput>> + Send + 'static,
    {
        self.handlers.insert(kind, Arc::new(move |args| Box::pin(f(args))));
        self
    }

    /// Looks up the handler for `kind`. `None` maps to the processor's
    /// `UnknownKind` failure path (§4.3.1 step 1) — retained as a runtime
    /// check even though [`HandlerRegistry::validate_complete`] is meant to
    /// catch the same gap earlier, at boot.
    pub fn get(&self, kind: OperationKind) -> Option<Handler> {
        self.handlers.get(&kind).cloned()
    }

    /// Boot-time completeness check (§9 redesign flag): every
    /// [`OperationKind`] the registry enumerates must have a registered
    /// handler. Deployments call this once at startup and fail fast rather
    /// than discovering the gap the first time a job of that kind is
    /// dequeued.
    pub fn validate_complete(&self) -> Result<(), Vec<OperationKind>> {
        let missing: Vec<OperationKind> = OperationKind::ALL
            .into_iter()
            .filter(|kind| !self.handlers.contains_key(kind))
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(missing)
        }
    }
}
