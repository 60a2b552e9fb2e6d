//! `JobManager`: the state machine authority that wires together the
//! durable log, the worker pool, progress tracking, and subscriber
//! fan-out (spec §4.3).
//!
//! The manager is the only component allowed to apply a `JobState`
//! transition. It never imports `sqlx` or any concrete store backend —
//! only the `JobStore`/`Store` traits — and it never holds a strong
//! reference to itself inside the pool's completion callback (spec §9
//! "Cyclic back-references"); `Arc::new_cyclic` hands the pool a `Weak`
//! instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::DataHubConfig;
use crate::error::{DataHubError, Result};
use crate::event::{Event, EventKind, Subscription};
use crate::health::{HealthChecker, ResourceMonitor, Scaler};
use crate::job::{CommandRegistry, Job, JobSpec, JobState, PauseFlag};
use crate::pool::{JobExecution, JobOutcome, PoolStats, WorkerPool};
use crate::progress::{Progress, ProgressTracker};
use crate::store::{JobStore, ListFilter};

/// Live, in-memory bookkeeping for a job that's been dispatched to the
/// pool but hasn't reached a terminal state. Removed on completion.
struct Inflight {
    cancellation: CancellationToken,
    pause: Arc<PauseFlag>,
}

/// Coordinates `Submit`/`Start`/`Pause`/`Resume`/`Cancel`/`Retry` (spec
/// §4.3), startup recovery, and the periodic cleanup sweep.
pub struct JobManager {
    store: Arc<dyn JobStore>,
    pool: Arc<WorkerPool>,
    progress: Arc<ProgressTracker>,
    registry: CommandRegistry,
    config: DataHubConfig,
    resources: Arc<ResourceMonitor>,
    health: Arc<HealthChecker>,
    scaler: Arc<Scaler>,
    inflight: DashMap<String, Inflight>,
    subscribers: DashMap<u64, Subscription>,
    next_subscriber_id: AtomicU64,
    background: std::sync::Mutex<Vec<CancellationToken>>,
}

impl JobManager {
    /// Builds the manager and its worker pool together, since the
    /// pool's completion sink needs a (weak) handle back to `Self`.
    pub fn new(
        store: Arc<dyn JobStore>,
        progress: Arc<ProgressTracker>,
        registry: CommandRegistry,
        config: DataHubConfig,
    ) -> Arc<Self> {
        let resources = Arc::new(ResourceMonitor::new(config.resources.clone()));
        let health = Arc::new(HealthChecker::new(config.pool.job_timeout));
        let scaler = Arc::new(Scaler::new(
            config.scheduler.clone(),
            config.pool.min_size,
            config.pool.max_size,
        ));

        Arc::new_cyclic(|weak: &Weak<JobManager>| {
            let weak_for_sink = weak.clone();
            let pool = WorkerPool::start(
                config.pool.default_size,
                config.pool.min_size,
                config.pool.max_size,
                config.pool.queue_size,
                Arc::new(move |outcome: JobOutcome| {
                    let weak = weak_for_sink.clone();
                    tokio::spawn(async move {
                        if let Some(manager) = weak.upgrade() {
                            manager.handle_outcome(outcome).await;
                        }
                    });
                }),
            );

            JobManager {
                store,
                pool,
                progress,
                registry,
                config,
                resources,
                health,
                scaler,
                inflight: DashMap::new(),
                subscribers: DashMap::new(),
                next_subscriber_id: AtomicU64::new(0),
                background: std::sync::Mutex::new(Vec::new()),
            }
        })
    }

    /// Starts the periodic health, scaling, and cleanup loops. Call
    /// once after construction; `shutdown` stops them.
    pub fn spawn_background_loops(self: &Arc<Self>) {
        let health_token = Arc::clone(&self.health).spawn_loop(
            Arc::clone(&self.pool),
            self.config.pool.health_interval,
        );
        let scale_token = Arc::clone(&self.scaler)
            .spawn_loop(Arc::clone(&self.pool), self.config.scheduler.tick_interval);

        let cleanup_token = CancellationToken::new();
        let cleanup_loop_token = cleanup_token.clone();
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(manager.config.manager.cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_cleanup_sweep().await,
                    _ = cleanup_loop_token.cancelled() => break,
                }
            }
        });

        let mut background = self.background.lock().expect("background lock poisoned");
        background.push(health_token);
        background.push(scale_token);
        background.push(cleanup_token);
    }

    /// Rewrites any job left `Running` by a prior process into `Queued`
    /// and re-dispatches it, since a `Running` row with no live worker
    /// can only mean the process died mid-execution (spec §4.3 "Startup
    /// recovery").
    pub async fn recover(self: &Arc<Self>) -> Result<usize> {
        let running = self
            .store
            .list(&ListFilter::with_states(vec![JobState::Running]))
            .await?;
        let mut recovered = 0;
        for mut job in running {
            warn!(job_id = %job.id, "recovering job left running by a prior process");
            job.state = JobState::Queued;
            job.updated_at = Utc::now();
            self.store.save(&job).await?;
            self.emit(Event::new(
                job.id.clone(),
                EventKind::Retrying,
                "recovered after restart",
            ));
            if let Err(e) = self.dispatch(&job).await {
                warn!(job_id = %job.id, error = %e, "failed to re-dispatch recovered job");
                continue;
            }
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Registers a subscriber; returns its id for later `unsubscribe`.
    pub fn subscribe(&self) -> (u64, tokio::sync::mpsc::Receiver<Event>) {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sub, rx) = crate::event::subscriber_channel(id);
        self.subscribers.insert(id, sub);
        (id, rx)
    }

    pub fn unsubscribe(&self, id: u64) {
        self.subscribers.remove(&id);
    }

    fn emit(&self, event: Event) {
        for entry in self.subscribers.iter() {
            entry.value().send(event.clone());
        }
    }

    /// Persists then fans out; never the other order, so a subscriber
    /// never observes an event the durable log doesn't have yet (spec
    /// §4.3 invariant v).
    async fn append_event(&self, event: Event) {
        if let Err(e) = self.store.append_event(&event).await {
            warn!(job_id = %event.job_id, error = %e, "failed to persist event");
        }
        self.emit(event);
    }

    /// Validates, persists as `Queued`, and dispatches (spec §4.3
    /// `Submit`). Validation failures never persist.
    pub async fn submit(self: &Arc<Self>, spec: JobSpec) -> Result<Job> {
        let body = self.registry.build(&spec)?;
        body.validate()
            .map_err(|e| DataHubError::ValidationError(e.0))?;

        let stats = self.pool.stats();
        self.resources.refresh();
        if !self
            .resources
            .can_accept(stats.queue_depth, stats.active_workers)
        {
            return Err(DataHubError::ResourceExhausted(
                "admission control denied submission".into(),
            ));
        }

        let mut job = Job::from_spec(spec);
        job.state = JobState::Queued;
        self.store.save(&job).await?;
        self.append_event(Event::new(job.id.clone(), EventKind::Submitted, "submitted")).await;
        self.dispatch(&job).await?;
        Ok(job)
    }

    /// Builds the job body fresh from the persisted job and hands it to
    /// the pool. Used both by `submit` and by recovery/retry paths.
    async fn dispatch(self: &Arc<Self>, job: &Job) -> Result<()> {
        let spec = JobSpec {
            id: job.id.clone(),
            kind: job.kind,
            priority: job.priority,
            description: job.description.clone(),
            created_by: job.created_by.clone(),
            max_retries: job.max_retries,
            metadata: job.metadata.clone(),
        };
        let body = self.registry.build(&spec)?;
        let cancellation = CancellationToken::new();
        let pause = PauseFlag::new();
        self.inflight.insert(
            job.id.clone(),
            Inflight {
                cancellation: cancellation.clone(),
                pause: Arc::clone(&pause),
            },
        );
        let weak = Arc::downgrade(self);
        let exec = JobExecution {
            job_id: job.id.clone(),
            priority: job.priority,
            body,
            progress: self.progress.handle(job.id.clone()),
            cancellation,
            pause,
            deadline: self.config.pool.job_timeout,
            on_start: Some(Arc::new(move |worker_index: usize, job_id: String| {
                let weak = weak.clone();
                tokio::spawn(async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.health.note_job_started(worker_index, &job_id);
                        if let Err(e) = manager.mark_started(&job_id).await {
                            warn!(job_id, error = %e, "failed to mark job started");
                        }
                    }
                });
            })),
        };
        self.pool.submit(exec)
    }

    async fn load_or_not_found(&self, job_id: &str) -> Result<Job> {
        self.store
            .load(job_id)
            .await?
            .ok_or_else(|| DataHubError::not_found(format!("job {job_id}")))
    }

    fn invalid(job_id: &str, reason: impl Into<String>) -> DataHubError {
        DataHubError::InvalidState {
            job_id: job_id.to_string(),
            reason: reason.into(),
        }
    }

    /// Marks the job `Running` and emits `Started` (spec §4.3 `Start`).
    /// Invoked via `JobExecution::on_start` the moment a worker picks
    /// the job up, not at submission time.
    pub async fn mark_started(&self, job_id: &str) -> Result<()> {
        let mut job = self.load_or_not_found(job_id).await?;
        if job.state.is_terminal() {
            return Ok(());
        }
        job.state = JobState::Running;
        job.started_at.get_or_insert(Utc::now());
        job.updated_at = Utc::now();
        self.store.save(&job).await?;
        self.append_event(Event::new(job_id, EventKind::Started, "started")).await;
        Ok(())
    }

    /// Sets the pause flag a running job body polls at its checkpoints
    /// (spec §4.3 `Pause`, legal only from `Running`).
    pub async fn pause(&self, job_id: &str) -> Result<()> {
        let job = self.load_or_not_found(job_id).await?;
        if job.state != JobState::Running {
            return Err(Self::invalid(job_id, "pause is only legal from running"));
        }
        let inflight = self
            .inflight
            .get(job_id)
            .ok_or_else(|| Self::invalid(job_id, "no in-flight execution for this job"))?;
        inflight.pause.set(true);
        drop(inflight);

        let mut job = job;
        job.state = JobState::Paused;
        job.updated_at = Utc::now();
        self.store.save(&job).await?;
        self.append_event(Event::new(job_id, EventKind::Paused, "paused")).await;
        Ok(())
    }

    /// Clears the pause flag (spec §4.3 `Resume`, legal from `Paused`).
    pub async fn resume(&self, job_id: &str) -> Result<()> {
        let mut job = self.load_or_not_found(job_id).await?;
        if job.state != JobState::Paused {
            return Err(Self::invalid(job_id, "resume is only legal from paused"));
        }
        if let Some(inflight) = self.inflight.get(job_id) {
            inflight.pause.set(false);
        }
        job.state = JobState::Running;
        job.updated_at = Utc::now();
        self.store.save(&job).await?;
        self.append_event(Event::new(job_id, EventKind::Resumed, "resumed")).await;
        Ok(())
    }

    /// Cancels the in-flight execution's cancellation token (spec §4.3
    /// `Cancel`, legal from `Queued`/`Running`/`Paused`). The worker
    /// pool's outcome handler applies the terminal transition once the
    /// body actually unwinds; this call only requests it.
    pub async fn cancel(&self, job_id: &str) -> Result<()> {
        let job = self.load_or_not_found(job_id).await?;
        if !matches!(
            job.state,
            JobState::Queued | JobState::Running | JobState::Paused
        ) {
            return Err(Self::invalid(job_id, "cancel is not legal from this state"));
        }
        if let Some(inflight) = self.inflight.get(job_id) {
            if job.state == JobState::Paused {
                inflight.pause.set(false);
            }
            inflight.cancellation.cancel();
            Ok(())
        } else {
            // Queued but not yet leased by a worker: no execution to
            // cancel cooperatively, so apply the terminal state here.
            let mut job = job;
            job.state = JobState::Cancelled;
            job.ended_at = Some(Utc::now());
            job.updated_at = Utc::now();
            self.store.save(&job).await?;
            self.progress.complete(job_id);
            self.append_event(Event::new(job_id, EventKind::Cancelled, "cancelled")).await;
            Ok(())
        }
    }

    /// Re-queues a `Failed` job, incrementing `retry_count` (spec §4.3
    /// `Retry`, legal only from `Failed`, bounded by `max_retries`).
    pub async fn retry(self: &Arc<Self>, job_id: &str) -> Result<()> {
        let mut job = self.load_or_not_found(job_id).await?;
        if job.state != JobState::Failed {
            return Err(Self::invalid(job_id, "retry is only legal from failed"));
        }
        if job.retry_count >= job.max_retries {
            return Err(Self::invalid(job_id, "retry budget exhausted"));
        }
        job.retry_count += 1;
        job.state = JobState::Queued;
        job.ended_at = None;
        job.last_error = None;
        job.updated_at = Utc::now();
        self.store.save(&job).await?;
        self.append_event(Event::new(job_id, EventKind::Retrying, "retrying")).await;
        self.dispatch(&job).await
    }

    pub async fn get(&self, job_id: &str) -> Result<Job> {
        self.load_or_not_found(job_id).await
    }

    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>> {
        self.store.list(filter).await
    }

    pub fn progress(&self, job_id: &str) -> Option<Progress> {
        self.progress.get(job_id)
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Applies the terminal (or retry-eligible) transition once a
    /// worker reports an execution's outcome (spec §4.3, §9 "narrow
    /// completion interface").
    async fn handle_outcome(&self, outcome: JobOutcome) {
        self.inflight.remove(&outcome.job_id);
        let job_id = outcome.job_id;

        let mut job = match self.store.load(&job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => {
                warn!(job_id, "outcome for a job with no persisted row");
                return;
            }
            Err(e) => {
                warn!(job_id, error = %e, "failed to load job for outcome handling");
                return;
            }
        };

        // A pause or explicit cancel may have already applied its own
        // terminal/paused transition; don't clobber it with a stale
        // outcome from the execution that was in flight when it fired.
        if job.state == JobState::Paused {
            return;
        }

        match outcome.result {
            Ok(()) => {
                job.state = JobState::Completed;
                job.ended_at = Some(Utc::now());
                job.updated_at = Utc::now();
                let _ = self.store.save(&job).await;
                self.progress.complete(&job_id);
                info!(job_id, duration = ?outcome.duration, "job completed");
                self.append_event(Event::new(job_id, EventKind::Completed, "completed")).await;
            }
            Err(DataHubError::Cancelled { reason }) => {
                job.state = JobState::Cancelled;
                job.ended_at = Some(Utc::now());
                job.last_error = Some(reason.to_string());
                job.updated_at = Utc::now();
                let _ = self.store.save(&job).await;
                self.progress.complete(&job_id);
                self.append_event(Event::new(
                    job_id,
                    EventKind::Cancelled,
                    format!("cancelled: {reason}"),
                ))
                .await;
            }
            Err(e) => {
                if matches!(e, DataHubError::Panic(_)) {
                    warn!(job_id, worker = outcome.worker_index, "marking worker unhealthy after job panic");
                    self.health.note_panic(outcome.worker_index);
                }
                job.state = JobState::Failed;
                job.ended_at = Some(Utc::now());
                job.last_error = Some(e.to_string());
                job.updated_at = Utc::now();
                let _ = self.store.save(&job).await;
                self.progress.complete(&job_id);
                self.append_event(Event::new(job_id, EventKind::Failed, e.to_string())).await;
            }
        }
    }

    /// Deletes terminal jobs older than `job_retention` (spec §4.3
    /// "periodic cleanup sweep").
    async fn run_cleanup_sweep(&self) {
        let cutoff = Utc::now() - self.config.manager.job_retention;
        let filter = ListFilter::with_states(vec![
            JobState::Completed,
            JobState::Failed,
            JobState::Cancelled,
        ]);
        let jobs = match self.store.list(&filter).await {
            Ok(jobs) => jobs,
            Err(e) => {
                warn!(error = %e, "cleanup sweep failed to list jobs");
                return;
            }
        };
        let mut removed = 0;
        for job in jobs {
            if job.ended_at.map(|t| t < cutoff).unwrap_or(false) {
                if let Err(e) = self.store.delete(&job.id).await {
                    warn!(job_id = %job.id, error = %e, "cleanup sweep failed to delete job");
                    continue;
                }
                self.progress.remove(&job.id);
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "cleanup sweep retired terminal jobs");
        }
    }

    /// Stops background loops and the worker pool (spec §4.4
    /// `Shutdown`).
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        for token in self.background.lock().expect("background lock poisoned").drain(..) {
            token.cancel();
        }
        self.pool.stop(timeout).await
    }
}
