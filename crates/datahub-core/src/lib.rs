//! # datahub-core
//!
//! The concurrent job subsystem for the data hub: a persistent,
//! priority-scheduled worker pool that runs long-lived download and
//! export jobs with pause/resume/retry semantics, real-time progress
//! tracking, health-monitored adaptive scaling, and a thread-safe
//! connection-pooled storage layer shared with interactive query
//! traffic.
//!
//! ## Architecture
//!
//! ```text
//! Submitter
//!     │  submit(spec)
//!     ▼
//! JobManager ──validate──► JobStore (persist Queued, emit `submitted`)
//!     │
//!     │ enqueue(JobExecution)
//!     ▼
//! WorkerPool ──dequeue──► Worker
//!                            │ lease()
//!                            ▼
//!                          Store ◄──────────┐ shared with
//!                            │              │ interactive readers
//!                            │ execute(ctx, progress_fn)
//!                            ▼
//!                     ProgressTracker ──persist──► JobStore
//!                            │
//!                            ▼ on terminal transition
//!                       JobManager ──emit──► subscribers (bounded, drop-on-full)
//! ```
//!
//! ## Key invariants
//!
//! 1. A job's `ended_at` is set iff its state is terminal.
//! 2. Once terminal (`Completed`/`Failed`/`Cancelled`), state never changes.
//! 3. Priority governs dequeue order only; running jobs are never preempted.
//! 4. A panicking job body never takes down its worker or the pool.
//! 5. Every manager-level transition persists before it is observable to
//!    subscribers.
//!
//! ## What this crate is not
//!
//! It is not a distributed scheduler, not an exactly-once pipeline, and
//! not a general SQL query planner. See `SPEC_FULL.md` for the full
//! non-goals list.

mod config;
mod error;
pub mod event;
pub mod health;
pub mod job;
pub mod jobs;
pub mod manager;
pub mod pool;
pub mod progress;
pub mod store;

#[cfg(test)]
mod codesmell_tests;

pub use config::{DataHubConfig, ManagerConfig, PoolConfig, ResourceLimits, SchedulerConfig};
pub use error::{CancelReason, DataHubError, Result};
pub use event::{Event, EventHandler, EventKind};
pub use health::{HealthChecker, ResourceMonitor, Scaler};
pub use jobs::{register_defaults, DownloadJob, DownloadSpec, ExportFormat, ExportJob, ExportSpec, SourceRegistry};
pub use job::{
    CommandRegistry, Job, JobBody, JobContext, JobKind, JobSpec, JobState, JobValidationError,
    Metadata, PauseFlag,
};
pub use manager::JobManager;
pub use pool::{JobExecution, PoolStats, WorkerPool};
pub use progress::{Progress, ProgressCallback, ProgressTracker};
pub use store::{Conn, DataSource, JobStore, ListFilter, Store};

pub use async_trait::async_trait;
