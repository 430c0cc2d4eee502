//! In-memory `JobQueue`, used by the processor's own tests and the demo
//! binary. FIFO-within-priority-class (§1), no persistence, no durability
//! across restarts — intentionally a test double, not a deployment option.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{AbortRegistry, ClaimedJob, JobCounts, JobQueue, JobState};
use crate::ids::{JobId, UserId};
use crate::job::Job;
use crate::operation::priority;

struct StoredJob {
    job: Job,
    state: JobState,
    ready_at: DateTime<Utc>,
    progress: Option<(u8, Option<String>)>,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, StoredJob>,
}

pub struct InMemoryJobQueue {
    inner: Mutex<Inner>,
    abort: AbortRegistry,
}

impl InMemoryJobQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            abort: AbortRegistry::new(),
        }
    }
}

impl Default for InMemoryJobQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobQueue for InMemoryJobQueue {
    async fn enqueue(&self, mut job: Job, delay: Option<Duration>) -> anyhow::Result<JobId> {
        let job_id = JobId::new();
        job = job.with_job_id(job_id);

        let now = Utc::now();
        let ready_at = now + chrono::Duration::from_std(delay.unwrap_or_default())?;
        let state = if delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        self.inner.lock().unwrap().jobs.insert(
            job_id,
            StoredJob {
                job,
                state,
                ready_at,
                progress: None,
            },
        );

        Ok(job_id)
    }

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .get(&job_id)
            .map(|s| s.job.clone()))
    }

    async fn get_job_state(&self, job_id: JobId) -> anyhow::Result<Option<JobState>> {
        Ok(self.inner.lock().unwrap().jobs.get(&job_id).map(|s| s.state))
    }

    async fn get_job_counts(&self) -> anyhow::Result<JobCounts> {
        let inner = self.inner.lock().unwrap();
        let mut counts = JobCounts::default();
        for stored in inner.jobs.values() {
            match stored.state {
                JobState::Waiting => counts.waiting += 1,
                JobState::Delayed => counts.delayed += 1,
                JobState::Active => counts.active += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Failed => counts.failed += 1,
                JobState::Superseded => counts.superseded += 1,
            }
        }
        Ok(counts)
    }

    async fn get_jobs_for_agent(&self, user_id: UserId) -> anyhow::Result<Vec<Job>> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .jobs
            .values()
            .filter(|s| s.job.user_id == user_id)
            .filter(|s| matches!(s.state, JobState::Waiting | JobState::Delayed | JobState::Active))
            .map(|s| s.job.clone())
            .collect())
    }

    async fn cancel_job(&self, job_id: JobId) -> anyhow::Result<bool> {
        let signalled = self.abort.cancel(job_id);
        let mut inner = self.inner.lock().unwrap();
        let found = inner.jobs.contains_key(&job_id);
        if let Some(stored) = inner.jobs.get_mut(&job_id) {
            if stored.state == JobState::Waiting || stored.state == JobState::Delayed {
                stored.state = JobState::Failed;
            }
        }
        Ok(signalled || found)
    }

    async fn claim_next(&self, _worker_id: &str) -> anyhow::Result<Option<ClaimedJob>> {
        let now = Utc::now();
        let mut inner = self.inner.lock().unwrap();

        let ready_id = inner
            .jobs
            .iter()
            .filter(|(_, s)| {
                (s.state == JobState::Waiting) || (s.state == JobState::Delayed && s.ready_at <= now)
            })
            .min_by_key(|(_, s)| (priority(s.job.operation_kind), s.job.enqueued_at))
            .map(|(id, _)| *id);

        let Some(job_id) = ready_id else {
            return Ok(None);
        };

        let stored = inner.jobs.get_mut(&job_id).expect("just found it");
        stored.state = JobState::Active;
        let job = stored.job.clone();
        drop(inner);

        let abort = self.abort.issue(job_id);
        Ok(Some(ClaimedJob { job, abort }))
    }

    async fn mark_completed(&self, job_id: JobId) -> anyhow::Result<()> {
        self.abort.remove(job_id);
        if let Some(stored) = self.inner.lock().unwrap().jobs.get_mut(&job_id) {
            stored.state = JobState::Completed;
        }
        Ok(())
    }

    async fn mark_failed(&self, job_id: JobId, _error: &str, _unrecoverable: bool) -> anyhow::Result<()> {
        self.abort.remove(job_id);
        if let Some(stored) = self.inner.lock().unwrap().jobs.get_mut(&job_id) {
            stored.state = JobState::Failed;
        }
        Ok(())
    }

    async fn mark_requeued(&self, job_id: JobId) -> anyhow::Result<()> {
        self.abort.remove(job_id);
        if let Some(stored) = self.inner.lock().unwrap().jobs.get_mut(&job_id) {
            stored.state = JobState::Superseded;
        }
        Ok(())
    }

    async fn set_progress(&self, job_id: JobId, progress: u8, label: Option<String>) -> anyhow::Result<()> {
        if let Some(stored) = self.inner.lock().unwrap().jobs.get_mut(&job_id) {
            stored.progress = Some((progress, label));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::OperationKind;

    fn job(kind: OperationKind) -> Job {
        Job::builder()
            .operation_kind(kind)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build()
    }

    #[tokio::test]
    async fn claim_next_returns_the_highest_priority_ready_job() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(job(OperationKind::SyncCustomers), None).await.unwrap();
        let submit_id = queue.enqueue(job(OperationKind::SubmitOrder), None).await.unwrap();

        let claimed = queue.claim_next("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.job.job_id, submit_id);
    }

    #[tokio::test]
    async fn fifo_within_the_same_priority_class() {
        let queue = InMemoryJobQueue::new();
        let first = queue.enqueue(job(OperationKind::SubmitOrder), None).await.unwrap();
        let _second = queue.enqueue(job(OperationKind::SubmitOrder), None).await.unwrap();

        let claimed = queue.claim_next("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.job.job_id, first);
    }

    #[tokio::test]
    async fn delayed_jobs_are_not_ready_until_their_delay_elapses() {
        let queue = InMemoryJobQueue::new();
        queue
            .enqueue(job(OperationKind::EditOrder), Some(Duration::from_secs(3600)))
            .await
            .unwrap();

        assert!(queue.claim_next("worker-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_job_signals_the_abort_token_of_an_active_job() {
        let queue = InMemoryJobQueue::new();
        queue.enqueue(job(OperationKind::SyncCustomers), None).await.unwrap();
        let claimed = queue.claim_next("worker-1").await.unwrap().unwrap();

        assert!(queue.cancel_job(claimed.job.job_id).await.unwrap());
        assert!(claimed.abort.is_cancelled());
    }

    #[tokio::test]
    async fn mark_completed_removes_job_from_future_claims() {
        let queue = InMemoryJobQueue::new();
        let id = queue.enqueue(job(OperationKind::SubmitOrder), None).await.unwrap();
        let claimed = queue.claim_next("worker-1").await.unwrap().unwrap();
        assert_eq!(claimed.job.job_id, id);

        queue.mark_completed(id).await.unwrap();
        assert_eq!(queue.get_job_state(id).await.unwrap(), Some(JobState::Completed));
        assert!(queue.claim_next("worker-1").await.unwrap().is_none());
    }
}
