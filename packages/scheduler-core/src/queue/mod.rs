//! Priority Queue (§4.4) — a FIFO-within-priority-class persisted job
//! queue. `JobQueue` is the interface the processor depends on; the crate
//! ships a Postgres-backed implementation ([`postgres::PostgresJobQueue`])
//! and an in-memory one for tests and the demo binary
//! ([`memory::InMemoryJobQueue`]).

pub mod memory;
pub mod postgres;

pub use memory::InMemoryJobQueue;
pub use postgres::PostgresJobQueue;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::ids::{JobId, UserId};
use crate::job::Job;

/// Where a job currently sits in the queue's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::Type)]
#[sqlx(type_name = "queue_job_state", rename_all = "snake_case")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
    /// Re-enqueued under a new job id without ever acquiring the agent
    /// lock (Data Model invariant 2(c)). Terminal for this row: unlike
    /// `Delayed`, a superseded row is never picked up by `claim_next`.
    Superseded,
}

/// `getJobCounts()` observability summary.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
    pub superseded: i64,
}

/// A job handed to a worker by [`JobQueue::claim_next`], paired with the
/// abort signal that unifies the configured timeout and an external
/// `cancelJob` (§5 "Cancellation semantics").
pub struct ClaimedJob {
    pub job: Job,
    pub abort: CancellationToken,
}

/// The capabilities the Operation Processor needs from the backing queue
/// (§4.4). Retry policy, `removeOnComplete`/`removeOnFail` bounding and the
/// unrecoverable-error marker are all implementation details of a given
/// backend; this trait only exposes the operations the processor and
/// public API callers actually invoke.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// `enqueue(kind, userId, data, idempotencyKey?, { delay? })`.
    async fn enqueue(&self, job: Job, delay: Option<Duration>) -> anyhow::Result<JobId>;

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<Job>>;

    async fn get_job_state(&self, job_id: JobId) -> anyhow::Result<Option<JobState>>;

    async fn get_job_counts(&self) -> anyhow::Result<JobCounts>;

    /// Filters by `data.userId` across waiting/active/delayed states.
    async fn get_jobs_for_agent(&self, user_id: UserId) -> anyhow::Result<Vec<Job>>;

    /// Signals any in-flight execution via the abort signal and returns
    /// whether a job was found to cancel.
    async fn cancel_job(&self, job_id: JobId) -> anyhow::Result<bool>;

    /// Dispatches the highest-priority ready job to the calling worker, or
    /// `None` if nothing is ready. Ready jobs are claimed atomically so two
    /// workers never receive the same job.
    async fn claim_next(&self, worker_id: &str) -> anyhow::Result<Option<ClaimedJob>>;

    async fn mark_completed(&self, job_id: JobId) -> anyhow::Result<()>;

    /// `unrecoverable = true` disables the kind's retry policy for this
    /// attempt (the timeout path, §4.4 "Unrecoverable-error marker").
    async fn mark_failed(&self, job_id: JobId, error: &str, unrecoverable: bool) -> anyhow::Result<()>;

    /// Marks a job row as superseded: it was re-enqueued under a new id
    /// before it ever acquired the agent lock, so this row must never be
    /// reported `Completed` and must never again be claimable.
    async fn mark_requeued(&self, job_id: JobId) -> anyhow::Result<()>;

    /// Updates the queue's per-job progress field; paired with the
    /// broadcast in `onProgress` (§4.3.4).
    async fn set_progress(&self, job_id: JobId, progress: u8, label: Option<String>) -> anyhow::Result<()>;
}

/// Process-local registry of per-job abort tokens. Cancellation is always
/// local to the worker process holding the job (§1 non-goals: no
/// distributed coordination), so both queue backends share this instead of
/// persisting tokens.
#[derive(Clone, Default)]
pub(crate) struct AbortRegistry {
    tokens: Arc<DashMap<JobId, CancellationToken>>,
}

impl AbortRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn issue(&self, job_id: JobId) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens.insert(job_id, token.clone());
        token
    }

    pub(crate) fn cancel(&self, job_id: JobId) -> bool {
        if let Some(token) = self.tokens.get(&job_id) {
            token.cancel();
            true
        } else {
            false
        }
    }

    pub(crate) fn remove(&self, job_id: JobId) {
        self.tokens.remove(&job_id);
    }

    #[cfg(test)]
    pub(crate) fn snapshot(&self) -> HashMap<JobId, CancellationToken> {
        self.tokens.iter().map(|e| (*e.key(), e.value().clone())).collect()
    }
}
