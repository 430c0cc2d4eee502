//! Per-agent operation scheduler core.
//!
//! Coordinates contention for the single authenticated browser context each
//! agent owns across write, per-order-read and scheduled-sync operations:
//! a priority job queue ([`queue`]), a per-agent mutual-exclusion lock with
//! cooperative preemption ([`agent_lock`]), and an operation processor
//! ([`processor`]) that binds jobs to browser contexts, enforces timeouts,
//! broadcasts lifecycle events and performs idempotent recovery via a
//! persisted bot-result store ([`store`]).
//!
//! The browser pool, broadcast channel and relational store are named
//! collaborator interfaces ([`browser_pool`], [`broadcast`], [`store`]);
//! this crate depends on them only through traits. Operation handlers
//! ([`registry`]) are likewise opaque async functions registered against
//! the closed set of operation kinds ([`operation`]).

pub mod agent_lock;
pub mod broadcast;
pub mod browser_pool;
pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod job;
pub mod operation;
pub mod processor;
pub mod queue;
pub mod registry;
pub mod store;
pub mod worker;

pub use agent_lock::AgentLock;
pub use config::Config;
pub use error::SchedulerError;
pub use ids::{JobId, UserId};
pub use job::Job;
pub use operation::OperationKind;
pub use processor::{Processor, ProcessorDeps, ProcessOutcome};
pub use registry::HandlerRegistry;
pub use worker::Worker;
