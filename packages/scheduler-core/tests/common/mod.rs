//! Shared Postgres test infrastructure (§8.4).
//!
//! One container, started once and reused across every integration test in
//! the binary — starting a fresh Postgres per test would dominate the
//! suite's wall-clock time.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::PgPool;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

struct SharedInfra {
    db_url: String,
    _container: ContainerAsync<Postgres>,
}

static SHARED_INFRA: OnceCell<SharedInfra> = OnceCell::const_new();

impl SharedInfra {
    async fn init() -> Result<Self> {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();

        let container = Postgres::default()
            .start()
            .await
            .context("failed to start postgres container")?;

        let host = container.get_host().await?;
        let port = container.get_host_port_ipv4(5432).await?;
        let db_url = format!("postgres://postgres:postgres@{host}:{port}/postgres");

        let pool = PgPool::connect(&db_url)
            .await
            .context("failed to connect to test database")?;
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run migrations")?;
        pool.close().await;

        Ok(Self {
            db_url,
            _container: container,
        })
    }

    async fn get() -> &'static Self {
        SHARED_INFRA
            .get_or_init(|| async { Self::init().await.expect("failed to start shared test infra") })
            .await
    }
}

/// Opens a fresh connection pool against the shared, already-migrated
/// database. Each test gets its own pool (so closing one doesn't affect
/// others) but the same underlying container and schema.
pub async fn test_pool() -> Arc<PgPool> {
    let infra = SharedInfra::get().await;
    Arc::new(
        PgPool::connect(&infra.db_url)
            .await
            .expect("failed to open a test pool"),
    )
}
