//! Runtime configuration loaded from the environment (§8.3).
//!
//! Required variables fail fast via `.context(...)`, optional ones fall
//! back to a documented default.

use std::env;

use anyhow::{Context, Result};
use dotenvy::dotenv;

/// Scheduler-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Connection string for the Postgres-backed queue and persistent store.
    pub database_url: String,
    /// Number of worker tasks to run in this process (§5: unbounded w.r.t.
    /// distinct agents, serialised per agent by the [`crate::AgentLock`]).
    /// Defaults to the available parallelism.
    pub worker_count: usize,
    /// How long an idle worker sleeps between `claim_next` attempts.
    pub poll_interval_ms: u64,
    /// Preemption poll interval during admission (§4.3.1), default 500ms.
    pub preemption_poll_interval_ms: u64,
    /// Preemption poll budget (§4.3.1), default 30s.
    pub preemption_timeout_ms: u64,
}

impl Config {
    /// Loads configuration from the environment, reading a `.env` file if
    /// present (development convenience).
    pub fn from_env() -> Result<Self> {
        let _ = dotenv();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            worker_count: env::var("SCHEDULER_WORKER_COUNT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)),
            poll_interval_ms: env::var("SCHEDULER_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(250),
            preemption_poll_interval_ms: env::var("SCHEDULER_PREEMPTION_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(500),
            preemption_timeout_ms: env::var("SCHEDULER_PREEMPTION_TIMEOUT_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30_000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_database_url_fails_fast() {
        env::remove_var("DATABASE_URL");
        let err = Config::from_env().unwrap_err();
        assert!(err.to_string().contains("DATABASE_URL"));
    }
}
