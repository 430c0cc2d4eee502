//! Operation Processor (§4.3) — the hard part of the core.
//!
//! Binds a dequeued job to a browser context, runs the registered handler
//! under a timeout and a combined `AbortSignal`, mediates preemption of
//! scheduled syncs by writes, re-enqueues with exponential backoff when
//! locked out, broadcasts lifecycle events, and records sync-event audit
//! rows.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::agent_lock::{AcquireResult, ActiveJob, AgentLock};
use crate::broadcast::BroadcastChannel;
use crate::browser_pool::BrowserPool;
use crate::error::SchedulerError;
use crate::events::JobEvent;
use crate::ids::{JobId, UserId};
use crate::job::{next_requeue, Job};
use crate::operation::{next_retry_delay, timeout as kind_timeout, OperationKind};
use crate::queue::{ClaimedJob, JobQueue};
use crate::registry::{EventEmitter, Handler, HandlerArgs, HandlerRegistry, ProgressReporter};
use crate::store::PersistentStore;

/// Injected dependencies the processor needs (§9 redesign flag
/// "shared singletons -> injected dependencies"). Cheap to clone.
#[derive(Clone)]
pub struct ProcessorDeps {
    pub queue: Arc<dyn JobQueue>,
    pub lock: AgentLock,
    pub browser_pool: Arc<dyn BrowserPool>,
    pub broadcast: Arc<dyn BroadcastChannel>,
    pub store: Arc<dyn PersistentStore>,
    pub handlers: HandlerRegistry,
    /// Default 500ms (§4.3.1).
    pub preemption_poll_interval: Duration,
    /// Default 30s (§4.3.1).
    pub preemption_timeout: Duration,
}

/// What happened to a dequeued job, for tests and operator observability.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    Completed {
        job_id: JobId,
        result: Value,
    },
    Failed {
        job_id: JobId,
        error: String,
        unrecoverable: bool,
        /// Set when the kind's retry policy (§4.4, §7) had attempts left
        /// and a successor job was enqueued to run after the backoff.
        retry_job_id: Option<JobId>,
    },
    /// The job never acquired the lock; a successor carries the
    /// incremented `requeue_count` (§4.3.1 step 3).
    Requeued {
        job_id: JobId,
        new_job_id: JobId,
        requeue_count: u32,
        delay: Duration,
    },
}

pub struct Processor {
    deps: ProcessorDeps,
}

impl Processor {
    pub fn new(deps: ProcessorDeps) -> Self {
        Self { deps }
    }

    /// Runs one dequeued job through admission, execution and
    /// finalisation (§4.3.1-§4.3.3).
    pub async fn process(&self, claimed: ClaimedJob) -> ProcessOutcome {
        let ClaimedJob { job, abort } = claimed;
        let job_id = job.job_id;
        let user_id = job.user_id;
        let kind = job.operation_kind;

        let Some(handler) = self.deps.handlers.get(kind) else {
            let err = SchedulerError::UnknownKind(kind);
            error!(%job_id, %kind, "no handler registered for operation kind");
            if let Err(e) = self.deps.queue.mark_failed(job_id, &err.to_string(), true).await {
                warn!(%job_id, error = %e, "failed to persist unknown-kind failure");
            }
            self.broadcast_event(
                user_id,
                JobEvent::Failed {
                    job_id,
                    operation_kind: kind,
                    error: err.to_string(),
                },
            )
            .await;
            return ProcessOutcome::Failed {
                job_id,
                error: err.to_string(),
                unrecoverable: true,
                retry_job_id: None,
            };
        };

        match self.deps.lock.acquire(user_id, job_id, kind) {
            AcquireResult::Acquired => self.execute(job, handler, abort).await,
            AcquireResult::Contended { active, preemptable } => {
                if preemptable {
                    self.preempt_then_execute(job, handler, abort, active).await
                } else {
                    self.requeue(job).await
                }
            }
        }
    }

    /// §4.3.1 step 3, preemptable branch: forceful `cancelJob` plus the
    /// graceful stop token, then poll `acquire` until it succeeds or the
    /// preemption budget is exhausted.
    async fn preempt_then_execute(
        &self,
        job: Job,
        handler: Handler,
        abort: CancellationToken,
        active: ActiveJob,
    ) -> ProcessOutcome {
        let user_id = job.user_id;
        let kind = job.operation_kind;
        let job_id = job.job_id;

        warn!(
            %job_id, incoming_kind = %kind, active_job_id = %active.job_id,
            "preempting scheduled sync for incoming write"
        );

        if let Err(e) = self.deps.queue.cancel_job(active.job_id).await {
            warn!(active_job_id = %active.job_id, error = %e, "cancel_job failed during preemption");
        }

        // §9.1 open question 1: re-fetch the active record right
        // before triggering the stop token rather than reusing the
        // `Contended` copy, so a concurrently-replaced token can never go
        // stale between capture and use.
        if let Some(current) = self.deps.lock.get_active(user_id) {
            if current.job_id == active.job_id {
                if let Some(token) = current.stop_token {
                    token.cancel();
                }
            }
        }

        let deadline = Instant::now() + self.deps.preemption_timeout;
        loop {
            match self.deps.lock.acquire(user_id, job_id, kind) {
                AcquireResult::Acquired => return self.execute(job, handler, abort).await,
                AcquireResult::Contended { .. } => {
                    if Instant::now() >= deadline {
                        warn!(%job_id, "preemption poll exhausted its budget, re-enqueueing");
                        return self.requeue(job).await;
                    }
                    tokio::time::sleep(self.deps.preemption_poll_interval).await;
                }
            }
        }
    }

    /// §4.3.1 step 3, non-preemptable branch and preemption-timeout
    /// exhaustion: `requeueCount <- (data.requeueCount ?? 0) + 1`,
    /// `delay <- min(2s * 2^(requeueCount-1), 30s)`. The lock was never
    /// held.
    async fn requeue(&self, job: Job) -> ProcessOutcome {
        let job_id = job.job_id;
        let (requeue_count, delay) = next_requeue(job.requeue_count);

        let mut next = job.clone();
        next.requeue_count = requeue_count;

        if let Err(e) = self.deps.queue.mark_requeued(job_id).await {
            warn!(%job_id, error = %e, "failed to mark the pre-admission attempt superseded on requeue");
        }

        match self.deps.queue.enqueue(next, Some(delay)).await {
            Ok(new_job_id) => {
                info!(%job_id, %new_job_id, requeue_count, delay_ms = delay.as_millis() as u64, "job re-enqueued after contention");
                ProcessOutcome::Requeued {
                    job_id,
                    new_job_id,
                    requeue_count,
                    delay,
                }
            }
            Err(e) => {
                error!(%job_id, error = %e, "failed to re-enqueue contended job");
                ProcessOutcome::Failed {
                    job_id,
                    error: e.to_string(),
                    unrecoverable: false,
                    retry_job_id: None,
                }
            }
        }
    }

    /// §4.3.2-§4.3.3: acquire a context, run the handler under the
    /// combined timeout/abort signal, broadcast the terminal event,
    /// release the context and the lock exactly once each, and record a
    /// sync-event audit row for `sync-*` kinds.
    async fn execute(&self, job: Job, handler: Handler, abort: CancellationToken) -> ProcessOutcome {
        let job_id = job.job_id;
        let user_id = job.user_id;
        let kind = job.operation_kind;

        let context = match self.deps.browser_pool.acquire_context(user_id, true).await {
            Ok(ctx) => ctx,
            Err(e) => {
                error!(%job_id, %kind, error = %e, "failed to acquire browser context");
                self.deps.lock.release(user_id, job_id);
                let err = SchedulerError::ContextAcquisition(e);
                self.broadcast_event(
                    user_id,
                    JobEvent::Failed {
                        job_id,
                        operation_kind: kind,
                        error: err.to_string(),
                    },
                )
                .await;
                if let Err(e) = self.deps.queue.mark_failed(job_id, &err.to_string(), false).await {
                    warn!(%job_id, error = %e, "failed to persist context-acquisition failure");
                }
                let retry_job_id = self.schedule_retry(&job, false).await;
                return ProcessOutcome::Failed {
                    job_id,
                    error: err.to_string(),
                    unrecoverable: false,
                    retry_job_id,
                };
            }
        };

        info!(%job_id, %kind, %user_id, "job admitted, starting handler");
        self.broadcast_event(
            user_id,
            JobEvent::Started {
                job_id,
                operation_kind: kind,
            },
        )
        .await;

        let progress = ProgressReporter::new(
            self.deps.queue.clone(),
            self.deps.broadcast.clone(),
            user_id,
            job_id,
            kind,
        );
        let emit = EventEmitter::new(self.deps.broadcast.clone(), user_id);

        // §4.3.2 step 7: combine the configured timeout with the queue's
        // per-job abort signal into a single token the handler observes.
        let combined = CancellationToken::new();
        let watcher = {
            let combined = combined.clone();
            let abort = abort.clone();
            tokio::spawn(async move {
                abort.cancelled().await;
                combined.cancel();
            })
        };

        let args = HandlerArgs {
            context: context.clone(),
            // §4.3.2 step 8: `data` never carried `requeueCount` to begin
            // with (job.rs keeps it out-of-band), so no stripping step is
            // needed here.
            data: job.handler_payload().clone(),
            user_id,
            job_id,
            progress,
            signal: combined.clone(),
            emit,
        };

        let timeout_duration = kind_timeout(kind);
        let started_at = Instant::now();

        let outcome: Result<Value, SchedulerError> = tokio::select! {
            res = (handler)(args) => match res {
                Ok(value) => match logical_failure_message(&value) {
                    Some(message) => Err(SchedulerError::HandlerError(message)),
                    None => Ok(value),
                },
                Err(e) => Err(SchedulerError::HandlerError(e.to_string())),
            },
            _ = tokio::time::sleep(timeout_duration) => Err(SchedulerError::HandlerTimeout {
                kind,
                timeout_ms: timeout_duration.as_millis() as u64,
                cancelled: false,
            }),
            _ = combined.cancelled() => Err(SchedulerError::HandlerTimeout {
                kind,
                timeout_ms: timeout_duration.as_millis() as u64,
                cancelled: true,
            }),
        };
        watcher.abort();
        let elapsed = started_at.elapsed();

        let success = outcome.is_ok();
        self.deps.browser_pool.release_context(user_id, context, success).await;
        self.deps.lock.release(user_id, job_id);

        match outcome {
            Ok(value) => {
                info!(%job_id, %kind, elapsed_ms = elapsed.as_millis() as u64, "job completed");
                self.broadcast_event(
                    user_id,
                    JobEvent::Completed {
                        job_id,
                        operation_kind: kind,
                        result: value.clone(),
                    },
                )
                .await;
                if let Err(e) = self.deps.queue.mark_completed(job_id).await {
                    warn!(%job_id, error = %e, "failed to persist job completion");
                }
                self.record_sync_event(kind, user_id, elapsed, Ok(&value)).await;
                ProcessOutcome::Completed { job_id, result: value }
            }
            Err(err) => {
                let unrecoverable = err.is_unrecoverable();
                error!(%job_id, %kind, error = %err, unrecoverable, "job failed");
                self.broadcast_event(
                    user_id,
                    JobEvent::Failed {
                        job_id,
                        operation_kind: kind,
                        error: err.to_string(),
                    },
                )
                .await;
                if let Err(e) = self
                    .deps
                    .queue
                    .mark_failed(job_id, &err.to_string(), unrecoverable)
                    .await
                {
                    warn!(%job_id, error = %e, "failed to persist job failure");
                }
                self.record_sync_event(kind, user_id, elapsed, Err(&err.to_string())).await;
                let retry_job_id = self.schedule_retry(&job, unrecoverable).await;
                ProcessOutcome::Failed {
                    job_id,
                    error: err.to_string(),
                    unrecoverable,
                    retry_job_id,
                }
            }
        }
    }

    /// §4.4, §7: after a job has executed and failed, consult its kind's
    /// retry policy and enqueue a successor with the appropriate backoff
    /// if attempts remain. Distinct from [`Self::requeue`], which handles
    /// a job that never acquired the lock at all.
    async fn schedule_retry(&self, job: &Job, unrecoverable: bool) -> Option<JobId> {
        if unrecoverable {
            return None;
        }
        let attempt = job.retry_count + 1;
        let delay = next_retry_delay(job.operation_kind, attempt)?;

        let mut next = job.clone();
        next.retry_count = attempt;

        match self.deps.queue.enqueue(next, Some(delay)).await {
            Ok(new_job_id) => {
                info!(
                    job_id = %job.job_id, %new_job_id, attempt, delay_ms = delay.as_millis() as u64,
                    "job scheduled for retry after execution failure"
                );
                Some(new_job_id)
            }
            Err(e) => {
                warn!(job_id = %job.job_id, error = %e, "failed to enqueue retry attempt");
                None
            }
        }
    }

    async fn broadcast_event(&self, user_id: UserId, event: JobEvent) {
        let stamped = event.into_broadcast(chrono::Utc::now());
        self.deps.broadcast.broadcast(user_id, stamped).await;
    }

    /// §4.3.3: for handlers whose kind begins with `sync-`, record a
    /// `sync_completed`/`sync_error` audit row with duration and either the
    /// result or error message. Failures in this logging are swallowed
    /// (§7 last bullet) but surfaced at `warn!` per §8.1.
    async fn record_sync_event(
        &self,
        kind: OperationKind,
        user_id: UserId,
        elapsed: Duration,
        outcome: Result<&Value, &str>,
    ) {
        if !kind.is_sync_event_logged() {
            return;
        }

        let (event_type, details) = match outcome {
            Ok(result) => (
                "sync_completed",
                serde_json::json!({ "durationMs": elapsed.as_millis() as u64, "result": result }),
            ),
            Err(error) => (
                "sync_error",
                serde_json::json!({ "durationMs": elapsed.as_millis() as u64, "error": error }),
            ),
        };

        if let Err(e) = self
            .deps
            .store
            .record_sync_event(user_id, kind, event_type, details)
            .await
        {
            warn!(%user_id, %kind, error = %e, "failed to persist sync-event audit row");
        }
    }
}

/// `{ success: false, error? }` is a logical failure (§6.4, §4.3.2 step
/// 10); any other shape (including `{ success: true, ... }` or a plain
/// result object) is a success.
fn logical_failure_message(value: &Value) -> Option<String> {
    let success = value.get("success")?.as_bool()?;
    if success {
        return None;
    }
    Some(
        value
            .get("error")
            .and_then(|e| e.as_str())
            .map(|s| s.to_string())
            .unwrap_or_else(|| "Sync completed with failure".to_string()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::InProcessBroadcast;
    use crate::browser_pool::ContextHandle;
    use crate::job::Job;
    use crate::operation::OperationKind;
    use crate::queue::{InMemoryJobQueue, JobState};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    struct StubBrowserPool {
        acquire_failures: AtomicUsize,
    }

    impl StubBrowserPool {
        fn new() -> Self {
            Self {
                acquire_failures: AtomicUsize::new(0),
            }
        }

        fn fail_next_acquire(&self) {
            self.acquire_failures.store(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl BrowserPool for StubBrowserPool {
        async fn acquire_context(
            &self,
            user_id: UserId,
            _from_queue: bool,
        ) -> anyhow::Result<ContextHandle> {
            if self.acquire_failures.swap(0, Ordering::SeqCst) == 1 {
                anyhow::bail!("pool exhausted");
            }
            Ok(ContextHandle(format!("ctx-{user_id}")))
        }

        async fn release_context(&self, _user_id: UserId, _handle: ContextHandle, _success: bool) {}
    }

    struct NoopStore;

    #[async_trait]
    impl PersistentStore for NoopStore {
        async fn get_bot_result(
            &self,
            _user_id: UserId,
            _kind: OperationKind,
            _operation_key: &str,
        ) -> anyhow::Result<Option<Value>> {
            Ok(None)
        }

        async fn put_bot_result(
            &self,
            _user_id: UserId,
            _kind: OperationKind,
            _operation_key: &str,
            _payload: Value,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn delete_bot_result(
            &self,
            _user_id: UserId,
            _kind: OperationKind,
            _operation_key: &str,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn record_sync_event(
            &self,
            _user_id: UserId,
            _sync_type: OperationKind,
            event_type: &str,
            _details: Value,
        ) -> anyhow::Result<()> {
            SYNC_EVENTS.lock().unwrap().push(event_type.to_string());
            Ok(())
        }
    }

    static SYNC_EVENTS: Mutex<Vec<String>> = Mutex::new(Vec::new());

    fn deps(queue: Arc<InMemoryJobQueue>, pool: Arc<StubBrowserPool>, handlers: HandlerRegistry) -> ProcessorDeps {
        ProcessorDeps {
            queue,
            lock: AgentLock::new(),
            browser_pool: pool,
            broadcast: Arc::new(InProcessBroadcast::new()),
            store: Arc::new(NoopStore),
            handlers,
            preemption_poll_interval: Duration::from_millis(10),
            preemption_timeout: Duration::from_millis(200),
        }
    }

    fn success_handler(_args: HandlerArgs) -> crate::registry::HandlerFuture {
        Box::pin(async { Ok(serde_json::json!({"success": true, "orderId": "ORD-1"})) })
    }

    fn logical_failure_handler(_args: HandlerArgs) -> crate::registry::HandlerFuture {
        Box::pin(async { Ok(serde_json::json!({"success": false, "error": "ERP rejected order"})) })
    }

    fn hanging_handler(_args: HandlerArgs) -> crate::registry::HandlerFuture {
        Box::pin(async {
            std::future::pending::<()>().await;
            unreachable!()
        })
    }

    #[tokio::test]
    async fn unknown_kind_fails_permanently() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let processor = Processor::new(deps(queue.clone(), pool, HandlerRegistry::new()));

        let job = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        let job_id = queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();
        assert_eq!(claimed.job.job_id, job_id);

        let outcome = processor.process(claimed).await;
        match outcome {
            ProcessOutcome::Failed { unrecoverable, .. } => assert!(unrecoverable),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn a_write_completes_and_emits_started_then_completed() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SubmitOrder, success_handler);
        let lock = AgentLock::new();
        let mut d = deps(queue.clone(), pool, handlers);
        d.lock = lock.clone();
        let processor = Processor::new(d);

        let user = UserId::new();
        let job = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(user)
            .data(serde_json::json!({"orderId": "ORD-1"}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        let outcome = processor.process(claimed).await;
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        assert!(lock.get_active(user).is_none());
    }

    #[tokio::test]
    async fn two_writes_for_the_same_agent_requeue_the_second_with_a_two_second_delay() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SubmitOrder, success_handler);
        handlers.register(OperationKind::EditOrder, success_handler);
        let lock = AgentLock::new();
        let user = UserId::new();

        // Hold the lock as if submit-order were already in flight.
        let active_job_id = JobId::new();
        lock.acquire(user, active_job_id, OperationKind::SubmitOrder);

        let mut d = deps(queue.clone(), pool, handlers);
        d.lock = lock.clone();
        let processor = Processor::new(d);

        let edit_job = Job::builder()
            .operation_kind(OperationKind::EditOrder)
            .user_id(user)
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(edit_job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();
        let original_job_id = claimed.job.job_id;

        let outcome = processor.process(claimed).await;
        match outcome {
            ProcessOutcome::Requeued { requeue_count, delay, .. } => {
                assert_eq!(requeue_count, 1);
                assert_eq!(delay, Duration::from_secs(2));
            }
            other => panic!("expected Requeued, got {other:?}"),
        }

        // The original row never acquired the lock, so it must not read
        // as Completed — a client polling its id would otherwise see a
        // job that never ran reported as having succeeded.
        assert_eq!(
            queue.get_job_state(original_job_id).await.unwrap(),
            Some(JobState::Superseded)
        );
    }

    #[tokio::test]
    async fn preemptable_contention_cancels_the_active_sync_and_admits_the_write() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SubmitOrder, success_handler);
        let lock = AgentLock::new();
        let user = UserId::new();

        // Simulate an in-flight scheduled sync with its own queue job so
        // cancel_job has something real to cancel.
        let sync_job = Job::builder()
            .operation_kind(OperationKind::SyncCustomers)
            .user_id(user)
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(sync_job, None).await.unwrap();
        let sync_claimed = queue.claim_next("sync-worker").await.unwrap().unwrap();
        lock.acquire(user, sync_claimed.job.job_id, OperationKind::SyncCustomers);

        let mut d = deps(queue.clone(), pool, handlers);
        d.lock = lock.clone();
        d.preemption_timeout = Duration::from_millis(500);
        let processor = Processor::new(d);

        // Release the sync's lock slot shortly after preemption starts,
        // standing in for the sync handler observing cancellation and
        // exiting.
        let lock_clone = lock.clone();
        let sync_job_id = sync_claimed.job.job_id;
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            lock_clone.release(user, sync_job_id);
        });

        let submit_job = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(user)
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(submit_job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        let outcome = processor.process(claimed).await;
        assert!(matches!(outcome, ProcessOutcome::Completed { .. }));
        assert!(sync_claimed.abort.is_cancelled());
    }

    #[tokio::test]
    async fn logical_failure_shape_is_reported_as_a_failed_job() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SendToVerona, logical_failure_handler);
        let processor = Processor::new(deps(queue.clone(), pool, handlers));

        let job = Job::builder()
            .operation_kind(OperationKind::SendToVerona)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        let outcome = processor.process(claimed).await;
        match outcome {
            ProcessOutcome::Failed { error, unrecoverable, .. } => {
                assert_eq!(error, "ERP rejected order");
                assert!(!unrecoverable);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn context_acquisition_failure_releases_the_lock_and_fails_the_job() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        pool.fail_next_acquire();
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SubmitOrder, success_handler);
        let lock = AgentLock::new();
        let mut d = deps(queue.clone(), pool, handlers);
        d.lock = lock.clone();
        let processor = Processor::new(d);

        let user = UserId::new();
        let job = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(user)
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        let outcome = processor.process(claimed).await;
        assert!(matches!(outcome, ProcessOutcome::Failed { unrecoverable: false, .. }));
        assert!(lock.get_active(user).is_none());
    }

    #[tokio::test]
    async fn external_cancellation_is_reported_as_a_handler_timeout_and_is_unrecoverable() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SubmitOrder, hanging_handler);
        let processor = Processor::new(deps(queue.clone(), pool, handlers));

        let job = Job::builder()
            .operation_kind(OperationKind::SubmitOrder)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();
        let job_id = claimed.job.job_id;

        let queue_for_cancel = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue_for_cancel.cancel_job(job_id).await.unwrap();
        });

        let outcome = processor.process(claimed).await;
        match outcome {
            ProcessOutcome::Failed { error, unrecoverable, .. } => {
                assert!(error.starts_with("Handler timeout after"));
                assert!(unrecoverable);
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_kinds_record_a_sync_completed_audit_row() {
        SYNC_EVENTS.lock().unwrap().clear();
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SyncCustomers, success_handler);
        let processor = Processor::new(deps(queue.clone(), pool, handlers));

        let job = Job::builder()
            .operation_kind(OperationKind::SyncCustomers)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        processor.process(claimed).await;
        assert_eq!(SYNC_EVENTS.lock().unwrap().as_slice(), ["sync_completed"]);
    }

    #[tokio::test]
    async fn execution_failure_on_a_retryable_kind_schedules_a_retry() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::DownloadDdtPdf, logical_failure_handler);
        let processor = Processor::new(deps(queue.clone(), pool, handlers));

        let job = Job::builder()
            .operation_kind(OperationKind::DownloadDdtPdf)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        let outcome = processor.process(claimed).await;
        let retry_job_id = match outcome {
            ProcessOutcome::Failed { retry_job_id, unrecoverable, .. } => {
                assert!(!unrecoverable);
                retry_job_id.expect("ddt downloads should retry once")
            }
            other => panic!("expected Failed, got {other:?}"),
        };

        assert_eq!(
            queue.get_job_state(retry_job_id).await.unwrap(),
            Some(JobState::Delayed)
        );
        let retry_job = queue.get_job(retry_job_id).await.unwrap().unwrap();
        assert_eq!(retry_job.retry_count, 1);
    }

    #[tokio::test]
    async fn execution_failure_on_a_non_retryable_kind_does_not_retry() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SendToVerona, logical_failure_handler);
        let processor = Processor::new(deps(queue.clone(), pool, handlers));

        let job = Job::builder()
            .operation_kind(OperationKind::SendToVerona)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();

        let outcome = processor.process(claimed).await;
        match outcome {
            ProcessOutcome::Failed { retry_job_id, .. } => assert!(retry_job_id.is_none()),
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn an_unrecoverable_failure_is_never_retried_even_for_a_retryable_kind() {
        let queue = Arc::new(InMemoryJobQueue::new());
        let pool = Arc::new(StubBrowserPool::new());
        let mut handlers = HandlerRegistry::new();
        handlers.register(OperationKind::SyncCustomers, hanging_handler);
        let processor = Processor::new(deps(queue.clone(), pool, handlers));

        let job = Job::builder()
            .operation_kind(OperationKind::SyncCustomers)
            .user_id(UserId::new())
            .data(serde_json::json!({}))
            .build();
        queue.enqueue(job, None).await.unwrap();
        let claimed = queue.claim_next("w").await.unwrap().unwrap();
        let job_id = claimed.job.job_id;

        let queue_for_cancel = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            queue_for_cancel.cancel_job(job_id).await.unwrap();
        });

        let outcome = processor.process(claimed).await;
        match outcome {
            ProcessOutcome::Failed { unrecoverable, retry_job_id, .. } => {
                assert!(unrecoverable);
                assert!(retry_job_id.is_none());
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[test]
    fn logical_failure_message_detects_success_false_and_defaults_the_message() {
        assert_eq!(
            logical_failure_message(&serde_json::json!({"success": false})),
            Some("Sync completed with failure".to_string())
        );
        assert_eq!(
            logical_failure_message(&serde_json::json!({"success": true})),
            None
        );
        assert_eq!(logical_failure_message(&serde_json::json!({"orderId": "X"})), None);
    }
}
