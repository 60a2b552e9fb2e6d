//! A `JobBody` driven by a fixed script of steps, used to build the
//! literal scenarios in spec §8 (S1 submit-and-complete, S2 priority
//! queueing, S3 cancel mid-flight, S5 panic isolation) without a real
//! data source or store.

use std::time::Duration;

use async_trait::async_trait;

use datahub_core::job::{JobBody, JobContext, Metadata};
use datahub_core::{CancelReason, DataHubError, Result};

/// One step of a scripted execution.
#[derive(Clone)]
pub enum Step {
    /// Report progress and sleep for the given duration before the
    /// next step (S1: `10, 20, ..., 100` at 50ms intervals).
    Report(u64, Duration),
    /// Sleep without reporting.
    Sleep(Duration),
    /// Panic immediately (S5).
    Panic,
}

/// Runs `steps` in order, checking for cancellation/pause before each
/// one, and reports `total` up front if set.
pub struct ScriptedJob {
    total: Option<u64>,
    steps: Vec<Step>,
}

impl ScriptedJob {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { total: None, steps }
    }

    pub fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }

    /// S1: ten reports of +10 at 50ms apart, total 100.
    pub fn completes_in_steps(count: u64, step: u64, interval: Duration) -> Self {
        let steps = (1..=count)
            .map(|i| Step::Report(i * step, interval))
            .collect();
        Self::new(steps).with_total(count * step)
    }

    /// S3: reports every `interval` indefinitely, relying on the
    /// caller to cancel the job out from under it.
    pub fn reports_forever(interval: Duration) -> Self {
        let steps = (1..=10_000u64).map(|i| Step::Report(i, interval)).collect();
        Self::new(steps)
    }

    /// S5: panics after `delay`.
    pub fn panics_after(delay: Duration) -> Self {
        Self::new(vec![Step::Sleep(delay), Step::Panic])
    }

    /// A long-running job that never finishes on its own (S2, S6):
    /// reports once a second until cancelled.
    pub fn runs_indefinitely() -> Self {
        Self::reports_forever(Duration::from_secs(1))
    }
}

#[async_trait]
impl JobBody for ScriptedJob {
    async fn execute(&self, ctx: JobContext) -> Result<()> {
        if let Some(total) = self.total {
            ctx.progress.set_total(total);
        }
        for step in &self.steps {
            ctx.checkpoint().await;
            if ctx.is_cancelled() {
                return Err(DataHubError::Cancelled {
                    reason: CancelReason::Requested,
                });
            }
            match step {
                Step::Report(n, sleep) => {
                    ctx.progress.report(*n, format!("step {n}"));
                    tokio::time::sleep(*sleep).await;
                }
                Step::Sleep(d) => tokio::time::sleep(*d).await,
                Step::Panic => panic!("scripted job panic"),
            }
        }
        Ok(())
    }

    fn describe(&self) -> Metadata {
        Metadata::new()
    }
}
