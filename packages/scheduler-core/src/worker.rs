//! Worker run loop (§5) — repeatedly claims the next ready job and hands it
//! to the [`Processor`], one agent's jobs serialised through the
//! [`crate::AgentLock`] but distinct agents processed concurrently.
//!
//! Claims one job, spawns it, and immediately tries to claim the next,
//! rather than batching: `claim_next` is a single-job call (§4.4), and
//! per-agent seriality is already enforced inside the processor rather
//! than by batching here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::processor::{Processor, ProcessOutcome, ProcessorDeps};
use crate::queue::JobQueue;

/// How long a worker waits for in-flight jobs to wind down after shutdown
/// is requested before giving up and returning anyway.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// How long an idle worker sleeps between `claim_next` attempts.
    pub poll_interval: Duration,
}

impl WorkerConfig {
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval,
        }
    }
}

/// Pulls jobs from the queue and runs them through a [`Processor`].
pub struct Worker {
    processor: Arc<Processor>,
    deps: ProcessorDeps,
    config: WorkerConfig,
}

impl Worker {
    pub fn new(deps: ProcessorDeps, config: WorkerConfig) -> Self {
        Self {
            processor: Arc::new(Processor::new(deps.clone())),
            deps,
            config,
        }
    }

    /// Runs until `shutdown` is cancelled, then waits (bounded) for
    /// in-flight jobs before returning.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker_id = %self.config.worker_id, "scheduler worker starting");

        let mut in_flight: JoinSet<()> = JoinSet::new();

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            // Reap finished tasks so the set doesn't grow unbounded.
            while in_flight.try_join_next().is_some() {}

            let claimed = match self.deps.queue.claim_next(&self.config.worker_id).await {
                Ok(claimed) => claimed,
                Err(e) => {
                    error!(error = %e, "failed to claim next job");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
            };

            let Some(claimed) = claimed else {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
                continue;
            };

            let job_id = claimed.job.job_id;
            let processor = self.processor.clone();
            in_flight.spawn(async move {
                match processor.process(claimed).await {
                    ProcessOutcome::Completed { .. } => {
                        debug!(%job_id, "job completed");
                    }
                    ProcessOutcome::Failed { error, unrecoverable, retry_job_id, .. } => {
                        warn!(%job_id, %error, unrecoverable, ?retry_job_id, "job failed");
                    }
                    ProcessOutcome::Requeued { new_job_id, requeue_count, .. } => {
                        debug!(%job_id, %new_job_id, requeue_count, "job requeued after contention");
                    }
                }
            });
        }

        let pending = in_flight.len();
        if pending > 0 {
            info!(count = pending, "waiting for in-flight jobs to finish");
            let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
            while in_flight.join_next().await.is_some() {
                if Instant::now() >= deadline {
                    warn!("timed out waiting for in-flight jobs to drain");
                    break;
                }
            }
        }

        info!(worker_id = %self.config.worker_id, "scheduler worker stopped");
    }
}
