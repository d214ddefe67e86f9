//! Runtime for the ordinaut task orchestrator.
//!
//! The core triad lives here: the scheduler loop that materializes firings
//! into the due-work queue, the worker pool that drains it under a
//! contention-free claim protocol, and the pipeline executor that runs each
//! task's declarative steps. The REST surface, credential issuance, and the
//! metrics endpoint are external collaborators built on top of the [`store`]
//! and [`health`] contracts.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use sqlx::PgPool;
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod config;
pub mod error;
pub mod health;
pub mod model;
pub mod pipeline;
pub mod queue;
pub mod reaper;
pub mod scheduler;
pub mod store;
pub mod tool;
pub mod worker;

mod util;

pub use self::config::{Args, Config, ConfigError};
pub use self::error::{ErrorClass, RunError};
pub use self::reaper::Reaper;
pub use self::scheduler::Scheduler;
pub use self::worker::Worker;

/// State shared by the scheduler, workers, and reaper of one process.
///
/// The pool is the only cross-worker coordination channel; everything else
/// here is process-local.
pub struct SharedState {
    pub pool: PgPool,
    pub config: Config,
    pub shutdown: CancellationToken,
    pub tools: Arc<dyn tool::ToolTransport>,

    /// Consecutive failed store round-trips, across all loops. Health
    /// reports the database as degraded once this reaches 3.
    store_failures: AtomicU32,
}

impl SharedState {
    pub fn new(pool: PgPool, config: Config, tools: Arc<dyn tool::ToolTransport>) -> Arc<Self> {
        Arc::new(Self {
            pool,
            config,
            shutdown: CancellationToken::new(),
            tools,
            store_failures: AtomicU32::new(0),
        })
    }

    pub fn store(&self) -> store::Store {
        store::Store::new(self.pool.clone())
    }

    pub fn consecutive_store_failures(&self) -> u32 {
        self.store_failures.load(Ordering::Relaxed)
    }

    pub(crate) fn note_store_ok(&self) {
        self.store_failures.store(0, Ordering::Relaxed);
    }

    pub(crate) fn note_store_failure(&self) {
        self.store_failures.fetch_add(1, Ordering::Relaxed);
    }
}
