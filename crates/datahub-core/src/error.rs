//! Error taxonomy for the job subsystem (spec §7).
//!
//! One variant per *kind*, not per concrete failure site. Callers match
//! on the kind to decide policy (retry, surface to UI, log and move on);
//! the message carries whatever detail a human needs.

use std::time::Duration;

/// The error taxonomy shared across every public operation boundary.
#[derive(Debug, thiserror::Error)]
pub enum DataHubError {
    /// Unknown job ID or data source.
    #[error("not found: {0}")]
    NotFound(String),

    /// Operation not legal for the job's current state.
    #[error("invalid state for job {job_id}: {reason}")]
    InvalidState { job_id: String, reason: String },

    /// The job's own `Validate` rejected the spec.
    #[error("validation failed: {0}")]
    ValidationError(String),

    /// The worker pool's bounded queue is saturated.
    #[error("queue full (depth {depth} >= max {max})")]
    QueueFull { depth: usize, max: usize },

    /// Admission control denied, or a connection lease timed out.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Cooperative cancellation, including the timeout subclass.
    #[error("cancelled: {reason}")]
    Cancelled { reason: CancelReason },

    /// The job body returned a non-cancellation error.
    #[error("execution failed: {0}")]
    ExecutionFailure(String),

    /// Store or journal I/O failed.
    #[error("persistence error: {0}")]
    PersistenceError(String),

    /// The job panicked; caught and mapped with a panic marker.
    #[error("panic: {0}")]
    Panic(String),
}

/// Why a cancellation occurred. `Timeout` is a recorded special case of
/// cancellation per spec §5 ("Timeout is a special cancellation cause").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Requested,
    Timeout(Duration),
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "requested"),
            CancelReason::Timeout(d) => write!(f, "timeout after {d:?}"),
        }
    }
}

impl DataHubError {
    /// Job-internal errors are never retried implicitly (spec §7); retry
    /// is always a caller decision via `Retry`. This only tells a caller
    /// whether the *kind* is the sort of thing worth ever retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DataHubError::ExecutionFailure(_)
                | DataHubError::ResourceExhausted(_)
                | DataHubError::PersistenceError(_)
        )
    }

    pub fn persistence(err: impl std::fmt::Display) -> Self {
        DataHubError::PersistenceError(err.to_string())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        DataHubError::NotFound(what.into())
    }
}

pub type Result<T> = std::result::Result<T, DataHubError>;
