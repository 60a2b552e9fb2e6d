//! Storage traits consumed by the job subsystem: the connection-pooled
//! record store (spec §4.1), the durable job log (spec §4.2), and the
//! external `DataSource` collaborator (spec §6).
//!
//! Concrete, SQLite-backed implementations live in the sibling
//! `datahub-sqlite` crate; everything in here is backend-agnostic so a
//! job body or the manager never imports `sqlx` directly (mirrors the
//! teacher's `Effect<Command, Deps>` split between policy and IO).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::Result;
use crate::event::Event;
use crate::job::{Job, JobKind};
use crate::job::JobState;
use crate::progress::Progress;

/// One row, keyed by column name.
pub type Row = serde_json::Map<String, Value>;

/// Result of a `Query`.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    pub rows: Vec<Row>,
}

/// Result of an `Exec`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    pub rows_affected: u64,
    pub last_insert_id: Option<i64>,
}

/// Point-in-time pool metrics (spec §3 "PoolStats/Metrics", §4.1).
#[derive(Debug, Clone, Copy, Default)]
pub struct PoolMetrics {
    pub capacity: usize,
    pub leased: usize,
    pub idle: usize,
    pub lifetime_lease_timeouts: u64,
    pub lifetime_slow_queries: u64,
}

/// A leased connection. Queries run against it directly; dropping it
/// returns the connection to the pool (spec §4.1 `Release`).
#[async_trait]
pub trait Conn: Send {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult>;
    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult>;
}

/// A transaction leased for its own lifetime (spec §4.1 `Begin`).
#[async_trait]
pub trait Tx: Send {
    async fn query(&mut self, sql: &str, args: &[Value]) -> Result<QueryResult>;
    async fn exec(&mut self, sql: &str, args: &[Value]) -> Result<ExecResult>;
    async fn commit(self: Box<Self>) -> Result<()>;
    async fn rollback(self: Box<Self>) -> Result<()>;
}

/// The bounded connection pool shared by background writers (jobs) and
/// foreground readers (interactive queries) (spec §4.1).
///
/// Invariant: at any moment `leased + idle = capacity`, and no
/// connection is concurrently used by two callers — upheld by whatever
/// concrete pool type this wraps (see `datahub-sqlite::SqliteStore`),
/// never by this trait itself.
#[async_trait]
pub trait Store: Send + Sync {
    /// Leases a connection, blocking up to the configured timeout; on
    /// timeout returns `ResourceExhausted` (spec §4.1 `Lease`).
    async fn lease(&self) -> Result<Box<dyn Conn>>;

    /// Lease, run, release (spec §4.1 `Query`/`Exec`).
    async fn query(&self, sql: &str, args: &[Value]) -> Result<QueryResult>;
    async fn exec(&self, sql: &str, args: &[Value]) -> Result<ExecResult>;

    /// Lease for the transaction's lifetime (spec §4.1 `Begin`).
    async fn begin(&self) -> Result<Box<dyn Tx>>;

    fn metrics(&self) -> PoolMetrics;
}

/// Filter fields for `JobStore::list` (spec §4.2).
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub states: Vec<JobState>,
    pub kinds: Vec<JobKind>,
    pub created_by: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl ListFilter {
    pub fn with_states(states: impl Into<Vec<JobState>>) -> Self {
        Self {
            states: states.into(),
            ..Default::default()
        }
    }

    fn matches(&self, job: &Job) -> bool {
        if !self.states.is_empty() && !self.states.contains(&job.state) {
            return false;
        }
        if !self.kinds.is_empty() && !self.kinds.contains(&job.kind) {
            return false;
        }
        if let Some(created_by) = &self.created_by {
            if &job.created_by != created_by {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if job.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if job.created_at > before {
                return false;
            }
        }
        true
    }

    /// Applies the filter to an already-loaded set, for stores that
    /// cannot push every clause into SQL (e.g. the in-memory test
    /// double in `datahub-testing`).
    pub fn apply<'a>(&self, jobs: impl IntoIterator<Item = &'a Job>) -> Vec<Job> {
        jobs.into_iter().filter(|j| self.matches(j)).cloned().collect()
    }
}

/// The durable job/progress/event log (spec §4.2, §6).
///
/// Every manager-level state transition MUST persist via this trait
/// before the transition is observable to subscribers — the log is the
/// source of truth on restart (spec §4.2, §4.3 "Startup recovery").
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Upserts by id.
    async fn save(&self, job: &Job) -> Result<()>;

    /// Upserts by job id.
    async fn save_progress(&self, progress: &Progress) -> Result<()>;

    /// Appends; never updates or deletes an existing row directly
    /// (only `delete`'s cascade removes events).
    async fn append_event(&self, event: &Event) -> Result<()>;

    async fn load(&self, job_id: &str) -> Result<Option<Job>>;
    async fn load_progress(&self, job_id: &str) -> Result<Option<Progress>>;

    /// Ordered by start-time descending (spec §4.2).
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>>;

    /// Cascades to progress and events (spec §4.2, §6 `ON DELETE CASCADE`).
    async fn delete(&self, job_id: &str) -> Result<()>;
}

/// One batch pulled from a `DataSource` (spec §4.7 `DownloadJob`).
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub items: Vec<Value>,
    pub next_cursor: Option<Value>,
    pub is_last: bool,
}

/// The external collaborator consumed by `DownloadJob` (spec §6).
/// Opaque by design: the core never knows the concrete feed protocol.
#[async_trait]
pub trait DataSource: Send + Sync {
    fn name(&self) -> &str;
    async fn get_status(&self) -> Result<Value>;
    async fn query(&self, sql: &str) -> Result<QueryResult>;
    fn schema(&self) -> Value;
    async fn pull_batch(&self, cursor: Option<Value>, n: usize) -> Result<Batch>;
}
