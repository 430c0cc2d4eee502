//! Error taxonomy for the operation scheduler.
//!
//! Distinguishes the small set of error shapes the core itself produces
//! (unknown kind, handler timeout, context acquisition, handler failure,
//! store failure) from the opaque errors handlers and collaborators raise,
//! which are carried through as `anyhow::Error`.

use thiserror::Error;

use crate::operation::OperationKind;

/// Errors raised by the scheduler core itself.
///
/// This is deliberately narrow: a handler's own business-logic errors are
/// not modeled here, they travel as the `String` payload of
/// [`SchedulerError::HandlerError`] or as the source of
/// [`SchedulerError::ContextAcquisition`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// No handler is registered for this operation kind. Permanent, never
    /// retried — the job is failed immediately on admission.
    #[error("no handler registered for operation kind {0}")]
    UnknownKind(OperationKind),

    /// Acquiring a browser context from the pool failed. Retry policy of
    /// the kind applies on the queue side.
    #[error("failed to acquire browser context")]
    ContextAcquisition(#[source] anyhow::Error),

    /// The handler did not return before its timeout, or was cancelled via
    /// the queue's abort signal. Always unrecoverable: the queue must not
    /// retry this attempt automatically.
    ///
    /// The outward message is identical for both causes (configured
    /// timeout vs. external cancellation) per the handler-contract's
    /// single wording; `cancelled` distinguishes the cause for logging
    /// only and never reaches the broadcast payload.
    #[error("Handler timeout after {timeout_ms}ms for {kind}")]
    HandlerTimeout {
        kind: OperationKind,
        timeout_ms: u64,
        cancelled: bool,
    },

    /// The handler either returned `Err`, or returned a result shaped
    /// `{ success: false, error }`. Retry policy of the kind applies.
    #[error("{0}")]
    HandlerError(String),

    /// A persistent-store operation (bot-result, sync-event, queue row)
    /// failed.
    #[error("persistent store error")]
    Store(#[source] sqlx::Error),
}

impl SchedulerError {
    /// Whether this error permanently disqualifies the job from the
    /// queue's normal retry policy (§6.1/§7: timeout and unknown-kind are
    /// both unrecoverable, everything else defers to the kind's policy).
    pub fn is_unrecoverable(&self) -> bool {
        matches!(
            self,
            SchedulerError::UnknownKind(_) | SchedulerError::HandlerTimeout { .. }
        )
    }
}
