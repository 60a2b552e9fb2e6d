//! Job identity, state machine, and the capability set concrete job
//! kinds implement (spec §3, §4.3, §9 "Interface abstraction over job
//! kinds").
//!
//! New job kinds add a tag to [`JobKind`] and a factory entry in a
//! [`CommandRegistry`] rather than a new trait hierarchy — the same
//! "tagged variant with a common capability set" shape the teacher uses
//! for commands.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::progress::ProgressHandle;

/// Arbitrary caller-attached metadata (spec §3 "opaque metadata map").
pub type Metadata = HashMap<String, Value>;

/// What a job does. New kinds are added here, not via subclassing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Download,
    Export,
    Maintenance,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::Download => "download",
            JobKind::Export => "export",
            JobKind::Maintenance => "maintenance",
        };
        f.write_str(s)
    }
}

/// The job state machine (spec §4.3). Transitions are validated by
/// [`JobState::can_transition_to`]; `JobManager` is the only component
/// allowed to apply them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Queued,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl JobState {
    /// Terminal states never transition again (spec §3 invariant iii).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Validates one edge of the diagram in spec §4.3. This is advisory
    /// for tests and defensive checks; `JobManager` re-derives the
    /// legality of an operation (`Start`/`Pause`/...) directly rather
    /// than calling this for every transition, since some operations
    /// have side effects (incrementing retry_count) beyond the state
    /// change itself.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Submitted, Queued)
                | (Queued, Running)
                | (Queued, Cancelled)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Paused)
                | (Running, Cancelled)
                | (Paused, Running)
                | (Paused, Queued)
                | (Paused, Cancelled)
                | (Failed, Queued)
        )
    }
}

/// A caller's request to run a job (spec §3 "Job").
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: String,
    pub kind: JobKind,
    pub priority: i32,
    pub description: String,
    pub created_by: String,
    pub max_retries: u32,
    pub metadata: Metadata,
}

impl JobSpec {
    pub fn new(id: impl Into<String>, kind: JobKind) -> Self {
        Self {
            id: id.into(),
            kind,
            priority: 0,
            description: String::new(),
            created_by: String::new(),
            max_retries: 3,
            metadata: Metadata::new(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_created_by(mut self, created_by: impl Into<String>) -> Self {
        self.created_by = created_by.into();
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }
}

/// Persisted job state (spec §3, §6 `jobs` table).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub priority: i32,
    pub state: JobState,
    pub description: String,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub metadata: Metadata,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_spec(spec: JobSpec) -> Self {
        let now = Utc::now();
        Job {
            id: spec.id,
            kind: spec.kind,
            priority: spec.priority,
            state: JobState::Submitted,
            description: spec.description,
            created_by: spec.created_by,
            created_at: now,
            started_at: None,
            ended_at: None,
            retry_count: 0,
            max_retries: spec.max_retries,
            metadata: spec.metadata,
            last_error: None,
            updated_at: now,
        }
    }
}

/// Validation failure surfaced immediately by `Submit` (spec §4.3,
/// never persisted).
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct JobValidationError(pub String);

/// Cooperative pause signal shared between `JobManager::pause`/`resume`
/// and a running job body (spec §4.3 `Pause`/`Resume`). Distinct from
/// cancellation: a paused job is expected to suspend between batches
/// and resume from where it left off, not unwind.
pub struct PauseFlag {
    paused: std::sync::atomic::AtomicBool,
    notify: tokio::sync::Notify,
}

impl PauseFlag {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            paused: std::sync::atomic::AtomicBool::new(false),
            notify: tokio::sync::Notify::new(),
        })
    }

    pub fn set(&self, paused: bool) {
        self.paused
            .store(paused, std::sync::atomic::Ordering::SeqCst);
        if !paused {
            self.notify.notify_waiters();
        }
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Suspends the caller while paused; returns immediately once
    /// `set(false)` is called. A job body calls this between batches
    /// (spec §4.3: pause takes effect "at the next checkpoint").
    pub async fn wait_while_paused(&self) {
        while self.is_paused() {
            self.notify.notified().await;
        }
    }
}

/// Execution context handed to a job body: cancellation and pause
/// signals for this execution, and a handle to report progress (spec
/// §4.7, §5).
pub struct JobContext {
    pub cancellation: CancellationToken,
    pub pause: Arc<PauseFlag>,
    pub progress: ProgressHandle,
}

impl JobContext {
    /// A per-batch child token; cancelling the execution cancels every
    /// batch token derived from it (spec §5 cancellation tree).
    pub fn batch_token(&self) -> CancellationToken {
        self.cancellation.child_token()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Checkpoint a job body calls between units of work: honors both
    /// pause and cancellation in one await point.
    pub async fn checkpoint(&self) {
        self.pause.wait_while_paused().await;
    }
}

/// The capability set every concrete job kind implements (spec §9).
/// `Execute` does the work; the rest let the manager and UI cooperate
/// with it without knowing its concrete type.
#[async_trait]
pub trait JobBody: Send + Sync {
    /// Validate the spec this body was built from. Called once at
    /// `Submit` time; failures never persist.
    fn validate(&self) -> std::result::Result<(), JobValidationError> {
        Ok(())
    }

    /// Run to completion or until `ctx.cancellation` fires. Must check
    /// cancellation at least once per batch (spec §5).
    async fn execute(&self, ctx: JobContext) -> Result<()>;

    /// Whether this job kind supports `Pause` (spec §4.3: legal only
    /// from `Running`, and only if the body says yes).
    fn can_pause(&self) -> bool {
        true
    }

    /// Free-form metadata surfaced to subscribers (e.g. source name,
    /// output path) distinct from the caller's opaque `Metadata` map.
    fn describe(&self) -> Metadata {
        Metadata::new()
    }
}

/// A boxed, type-erased job body plus the id/kind it belongs to.
pub type BoxedJobBody = Arc<dyn JobBody>;

/// Maps a `JobKind` tag to a factory producing the concrete body from a
/// spec's metadata (spec §9 "new job kinds add a tag and factory
/// entry"). Intentionally simple: a `HashMap` is sufficient because
/// registration happens once at startup, never under contention.
#[derive(Default, Clone)]
pub struct CommandRegistry {
    factories: HashMap<JobKind, Arc<dyn Fn(&JobSpec) -> Result<BoxedJobBody> + Send + Sync>>,
}

impl CommandRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, kind: JobKind, factory: F)
    where
        F: Fn(&JobSpec) -> Result<BoxedJobBody> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
    }

    pub fn build(&self, spec: &JobSpec) -> Result<BoxedJobBody> {
        let factory = self
            .factories
            .get(&spec.kind)
            .ok_or_else(|| crate::error::DataHubError::ValidationError(format!(
                "no job body registered for kind {}",
                spec.kind
            )))?;
        factory(spec)
    }
}

impl fmt::Debug for CommandRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}
