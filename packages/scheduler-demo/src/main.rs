//! Demo CLI for the per-agent operation scheduler.
//!
//! Wires the Postgres-backed queue, persistent store and in-process
//! broadcast hub to a fixed set of illustrative handlers (`handlers.rs`)
//! behind a stand-in browser pool (`browser_pool.rs`), and exposes a
//! handful of subcommands to drive the system: run workers, enqueue a job,
//! inspect queue counts, or cancel a job — a small clap front door over
//! the library crate.

mod browser_pool;
mod handlers;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use scheduler_core::broadcast::InProcessBroadcast;
use scheduler_core::processor::ProcessorDeps;
use scheduler_core::queue::{JobQueue, PostgresJobQueue};
use scheduler_core::store::{PersistentStore, PostgresStore};
use scheduler_core::worker::{Worker, WorkerConfig};
use scheduler_core::{AgentLock, Config, Job, OperationKind, UserId};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "scheduler-demo")]
#[command(about = "Demo front door for the per-agent operation scheduler")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run worker tasks until interrupted.
    Serve {
        /// Overrides `SCHEDULER_WORKER_COUNT`.
        #[arg(long)]
        workers: Option<usize>,
    },
    /// Enqueue a single job and print its id.
    Enqueue {
        /// One of the registry's operation kinds, e.g. `submit-order`.
        kind: String,
        /// Agent identifier; a random id is generated if omitted.
        #[arg(long)]
        user_id: Option<String>,
        /// JSON payload, e.g. `{"orderId": "ORD-1"}`.
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Print queue counts.
    Status,
    /// Cancel a queued or in-flight job by id.
    Cancel {
        job_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,scheduler_core=debug,scheduler_demo=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let pool = PgPoolOptions::new()
        .max_connections(config.worker_count as u32 + 2)
        .connect(&config.database_url)
        .await
        .context("failed to connect to the scheduler database")?;

    sqlx::migrate!("../scheduler-core/migrations")
        .run(&pool)
        .await
        .context("failed to run scheduler migrations")?;

    let queue: Arc<dyn JobQueue> = Arc::new(PostgresJobQueue::new(pool.clone()));
    let store: Arc<dyn PersistentStore> = Arc::new(PostgresStore::new(pool.clone()));
    let broadcast = Arc::new(InProcessBroadcast::new());
    let handlers = handlers::build_registry(store.clone());

    if let Err(missing) = handlers.validate_complete() {
        anyhow::bail!("boot-time check failed, no handler registered for: {missing:?}");
    }

    match cli.command {
        Commands::Serve { workers } => {
            let worker_count = workers.unwrap_or(config.worker_count).max(1);
            tracing::info!(worker_count, "starting scheduler workers");

            let deps = ProcessorDeps {
                queue,
                lock: AgentLock::new(),
                browser_pool: Arc::new(browser_pool::DemoBrowserPool::new()),
                broadcast,
                store,
                handlers,
                preemption_poll_interval: Duration::from_millis(config.preemption_poll_interval_ms),
                preemption_timeout: Duration::from_millis(config.preemption_timeout_ms),
            };

            let shutdown = CancellationToken::new();
            let mut tasks = Vec::with_capacity(worker_count);
            for _ in 0..worker_count {
                let worker_deps = deps.clone();
                let worker_shutdown = shutdown.clone();
                let worker_config = WorkerConfig::new(Duration::from_millis(config.poll_interval_ms));
                tasks.push(tokio::spawn(async move {
                    Worker::new(worker_deps, worker_config).run(worker_shutdown).await;
                }));
            }

            signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            tracing::info!("shutdown requested, draining in-flight jobs");
            shutdown.cancel();
            for task in tasks {
                let _ = task.await;
            }
        }
        Commands::Enqueue { kind, user_id, data } => {
            let operation_kind = parse_kind(&kind)?;
            let user_id = match user_id {
                Some(s) => s.parse().context("invalid --user-id, expected a UUID")?,
                None => UserId::new(),
            };
            let payload: serde_json::Value = serde_json::from_str(&data).context("--data must be valid JSON")?;

            let job = Job::builder()
                .operation_kind(operation_kind)
                .user_id(user_id)
                .data(payload)
                .build();
            let job_id = queue.enqueue(job, None).await?;
            println!("enqueued {job_id} for agent {user_id} ({kind})");
        }
        Commands::Status => {
            let counts = queue.get_job_counts().await?;
            println!(
                "waiting={} delayed={} active={} completed={} failed={} superseded={}",
                counts.waiting, counts.delayed, counts.active, counts.completed, counts.failed, counts.superseded
            );
        }
        Commands::Cancel { job_id } => {
            let job_id = job_id.parse().context("invalid job id, expected a UUID")?;
            let cancelled = queue.cancel_job(job_id).await?;
            println!("cancelled={cancelled}");
        }
    }

    Ok(())
}

fn parse_kind(s: &str) -> Result<OperationKind> {
    OperationKind::ALL
        .into_iter()
        .find(|k| k.as_str() == s)
        .with_context(|| {
            let valid: Vec<&str> = OperationKind::ALL.iter().map(|k| k.as_str()).collect();
            format!("unknown operation kind {s:?}, expected one of {valid:?}")
        })
}
