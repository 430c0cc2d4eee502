//! Postgres-backed `JobQueue`. Jobs live in a single `jobs` table; claiming
//! uses `FOR UPDATE SKIP LOCKED` so concurrent workers never receive the
//! same row (§5 "Parallel workers pull jobs from the queue").

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use tracing::debug;
use uuid::Uuid;

use super::{AbortRegistry, ClaimedJob, JobCounts, JobQueue, JobState};
use crate::ids::{JobId, UserId};
use crate::job::Job;
use crate::operation::{priority, OperationKind};

pub struct PostgresJobQueue {
    pool: PgPool,
    abort: AbortRegistry,
}

impl PostgresJobQueue {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            abort: AbortRegistry::new(),
        }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    job_id: Uuid,
    operation_kind: OperationKind,
    user_id: Uuid,
    data: Value,
    idempotency_key: String,
    enqueued_at: DateTime<Utc>,
    requeue_count: i32,
    retry_count: i32,
    state: JobState,
}

impl From<JobRow> for Job {
    fn from(row: JobRow) -> Self {
        Job::builder()
            .operation_kind(row.operation_kind)
            .user_id(UserId::from_uuid(row.user_id))
            .data(row.data)
            .idempotency_key(row.idempotency_key)
            .enqueued_at(row.enqueued_at)
            .requeue_count(row.requeue_count as u32)
            .retry_count(row.retry_count as u32)
            .build()
            .with_job_id(JobId::from_uuid(row.job_id))
    }
}

#[async_trait]
impl JobQueue for PostgresJobQueue {
    async fn enqueue(&self, job: Job, delay: Option<Duration>) -> anyhow::Result<JobId> {
        let job_id = JobId::new();
        let ready_at = Utc::now() + chrono::Duration::from_std(delay.unwrap_or_default())?;
        let state = if delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (
                job_id, operation_kind, user_id, data, idempotency_key,
                enqueued_at, requeue_count, retry_count, priority, state, ready_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(job_id)
        .bind(job.operation_kind)
        .bind(job.user_id)
        .bind(&job.data)
        .bind(&job.idempotency_key)
        .bind(job.enqueued_at)
        .bind(job.requeue_count as i32)
        .bind(job.retry_count as i32)
        .bind(priority(job.operation_kind))
        .bind(state)
        .bind(ready_at)
        .execute(&self.pool)
        .await?;

        Ok(job_id)
    }

    async fn get_job(&self, job_id: JobId) -> anyhow::Result<Option<Job>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            SELECT job_id, operation_kind, user_id, data, idempotency_key,
                   enqueued_at, requeue_count, retry_count, state
            FROM jobs WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Job::from))
    }

    async fn get_job_state(&self, job_id: JobId) -> anyhow::Result<Option<JobState>> {
        let row: Option<(JobState,)> = sqlx::query_as("SELECT state FROM jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|(s,)| s))
    }

    async fn get_job_counts(&self) -> anyhow::Result<JobCounts> {
        let rows: Vec<(JobState, i64)> =
            sqlx::query_as("SELECT state, COUNT(*) FROM jobs GROUP BY state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts = JobCounts::default();
        for (state, n) in rows {
            match state {
                JobState::Waiting => counts.waiting = n,
                JobState::Delayed => counts.delayed = n,
                JobState::Active => counts.active = n,
                JobState::Completed => counts.completed = n,
                JobState::Failed => counts.failed = n,
                JobState::Superseded => counts.superseded = n,
            }
        }
        Ok(counts)
    }

    async fn get_jobs_for_agent(&self, user_id: UserId) -> anyhow::Result<Vec<Job>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            r#"
            SELECT job_id, operation_kind, user_id, data, idempotency_key,
                   enqueued_at, requeue_count, retry_count, state
            FROM jobs
            WHERE user_id = $1 AND state IN ('waiting', 'delayed', 'active')
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Job::from).collect())
    }

    async fn cancel_job(&self, job_id: JobId) -> anyhow::Result<bool> {
        let signalled = self.abort.cancel(job_id);

        let result = sqlx::query(
            r#"
            UPDATE jobs SET state = 'failed'
            WHERE job_id = $1 AND state IN ('waiting', 'delayed')
            "#,
        )
        .bind(job_id)
        .execute(&self.pool)
        .await?;

        Ok(signalled || result.rows_affected() > 0)
    }

    async fn claim_next(&self, worker_id: &str) -> anyhow::Result<Option<ClaimedJob>> {
        let row: Option<JobRow> = sqlx::query_as(
            r#"
            WITH candidate AS (
                SELECT job_id FROM jobs
                WHERE state = 'waiting' OR (state = 'delayed' AND ready_at <= NOW())
                ORDER BY priority ASC, enqueued_at ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE jobs
            SET state = 'active'
            FROM candidate
            WHERE jobs.job_id = candidate.job_id
            RETURNING jobs.job_id, jobs.operation_kind, jobs.user_id, jobs.data,
                      jobs.idempotency_key, jobs.enqueued_at, jobs.requeue_count,
                      jobs.retry_count, jobs.state
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let job_id = JobId::from_uuid(row.job_id);
        debug!(%job_id, worker_id, "claimed job");
        let job = Job::from(row);
        let abort = self.abort.issue(job_id);
        Ok(Some(ClaimedJob { job, abort }))
    }

    async fn mark_completed(&self, job_id: JobId) -> anyhow::Result<()> {
        self.abort.remove(job_id);
        sqlx::query("UPDATE jobs SET state = 'completed' WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn mark_failed(&self, job_id: JobId, error: &str, unrecoverable: bool) -> anyhow::Result<()> {
        self.abort.remove(job_id);
        sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'failed', error_message = $2, unrecoverable = $3
            WHERE job_id = $1
            "#,
        )
        .bind(job_id)
        .bind(error)
        .bind(unrecoverable)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_requeued(&self, job_id: JobId) -> anyhow::Result<()> {
        self.abort.remove(job_id);
        sqlx::query("UPDATE jobs SET state = 'superseded' WHERE job_id = $1")
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_progress(&self, job_id: JobId, progress: u8, label: Option<String>) -> anyhow::Result<()> {
        sqlx::query("UPDATE jobs SET progress = $2, progress_label = $3 WHERE job_id = $1")
            .bind(job_id)
            .bind(progress as i16)
            .bind(label)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
