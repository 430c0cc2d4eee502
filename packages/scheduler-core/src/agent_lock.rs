//! Agent Lock — the in-memory per-agent mutual-exclusion slot (§4.2).
//!
//! One active-job record per `userId`, held in a [`DashMap`] so each
//! mutator runs under that entry's shard lock — a critical section, never
//! a blocking wait. Contention is always signalled through the return
//! value of [`AgentLock::acquire`]; the processor decides what to do
//! about it.

use std::fmt;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::ids::{JobId, UserId};
use crate::operation::{is_scheduled_sync, is_write, OperationKind};

/// The in-memory per-agent singleton (§3 "Active job record").
///
/// `stop_token` models the cooperative-stop callback from §4.2 as
/// a [`CancellationToken`] rather than a closure (§9 redesign flag): the
/// handler calls [`AgentLock::set_stop_token`] once it begins, and a
/// preempting contender cancels it directly instead of invoking a
/// borrowed function pointer.
#[derive(Clone)]
pub struct ActiveJob {
    pub job_id: JobId,
    pub operation_kind: OperationKind,
    pub stop_token: Option<CancellationToken>,
}

/// Outcome of [`AgentLock::acquire`].
pub enum AcquireResult {
    /// No record was present; the slot now holds `{ job_id, kind }`.
    Acquired,
    /// A record was already present. `preemptable` is exactly
    /// `isScheduledSync(active.operation_kind) && isWrite(incoming_kind)` —
    /// the only condition under which preemption is permitted (§4.2).
    Contended {
        active: ActiveJob,
        preemptable: bool,
    },
}

impl fmt::Debug for AcquireResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AcquireResult::Acquired => write!(f, "Acquired"),
            AcquireResult::Contended { active, preemptable } => f
                .debug_struct("Contended")
                .field("active_job_id", &active.job_id)
                .field("active_kind", &active.operation_kind)
                .field("preemptable", preemptable)
                .finish(),
        }
    }
}

/// Per-agent mutual-exclusion lock. Cheap to clone — internally an
/// `Arc`-backed [`DashMap`].
#[derive(Clone, Default)]
pub struct AgentLock {
    slots: DashMap<UserId, ActiveJob>,
}

impl AgentLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// `acquire(userId, jobId, kind)`. No re-entrancy: calling this again
    /// for a slot this same `(job_id, kind)` already holds still returns
    /// `Contended` — the caller must track that it already owns the slot
    /// from the first `Acquired` result.
    pub fn acquire(&self, user_id: UserId, job_id: JobId, kind: OperationKind) -> AcquireResult {
        match self.slots.entry(user_id) {
            Entry::Vacant(v) => {
                v.insert(ActiveJob {
                    job_id,
                    operation_kind: kind,
                    stop_token: None,
                });
                AcquireResult::Acquired
            }
            Entry::Occupied(o) => {
                let active = o.get().clone();
                let preemptable = is_scheduled_sync(active.operation_kind) && is_write(kind);
                AcquireResult::Contended { active, preemptable }
            }
        }
    }

    /// `release(userId, jobId)`. Clears the slot only if the current
    /// record's `jobId` matches; a stale release (wrong id, or an already
    /// empty slot) is a no-op that returns `false`.
    pub fn release(&self, user_id: UserId, job_id: JobId) -> bool {
        self.slots
            .remove_if(&user_id, |_, active| active.job_id == job_id)
            .is_some()
    }

    /// Attaches `token` to the current record. No-op when the slot is
    /// empty. Overwrites any prior token — per §9.1 open
    /// question 1, contenders must re-fetch the active record via
    /// [`AgentLock::get_active`] immediately before invoking it rather
    /// than caching a token captured from an earlier `Contended` result,
    /// so overwriting here cannot produce a stale-callback invocation.
    pub fn set_stop_token(&self, user_id: UserId, token: CancellationToken) {
        if let Some(mut entry) = self.slots.get_mut(&user_id) {
            entry.stop_token = Some(token);
        }
    }

    /// Observational read of one agent's slot.
    pub fn get_active(&self, user_id: UserId) -> Option<ActiveJob> {
        self.slots.get(&user_id).map(|e| e.clone())
    }

    /// Independent snapshot of every occupied slot; mutating the returned
    /// map never affects internal state.
    pub fn get_all_active(&self) -> std::collections::HashMap<UserId, ActiveJob> {
        self.slots
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect()
    }
}
