//! Priority worker pool: bounded queue, worker lifecycle, panic
//! isolation, deadlines, and live-resizing (spec §4.4, §9 "Cyclic
//! back-references" — the pool never calls back into the manager
//! directly; it reports outcomes through a narrow [`CompletionSink`]).

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::{CancelReason, DataHubError, Result};
use crate::job::{BoxedJobBody, JobContext, PauseFlag};
use crate::progress::ProgressHandle;

/// A leased unit of work the pool dispatches to a worker (spec §4.4,
/// GLOSSARY "Execution").
pub struct JobExecution {
    pub job_id: String,
    pub priority: i32,
    pub body: BoxedJobBody,
    pub progress: ProgressHandle,
    pub cancellation: CancellationToken,
    pub pause: Arc<PauseFlag>,
    pub deadline: Duration,
    /// Invoked the moment a worker actually begins this execution, not
    /// when it's enqueued (spec §4.3 `Start`: "the job transitions to
    /// Running once a worker begins executing it"). Receives the
    /// worker's roster index so the caller can feed a health tracker.
    pub on_start: Option<Arc<dyn Fn(usize, String) + Send + Sync>>,
}

/// The outcome a worker reports back through the narrow completion
/// interface (spec §9: "worker → manager via a narrow completion
/// interface").
#[derive(Debug)]
pub struct JobOutcome {
    pub job_id: String,
    pub result: Result<()>,
    pub duration: Duration,
    /// Which worker ran this job, so a panic can be attributed to a
    /// specific roster slot for `HealthChecker::note_panic`.
    pub worker_index: usize,
}

/// Callback the pool uses to report completions. The manager is the
/// only real implementor; kept as a trait object so the pool has zero
/// compile-time knowledge of the manager.
pub type CompletionSink = Arc<dyn Fn(JobOutcome) + Send + Sync>;

struct QueuedExecution {
    seq: u64,
    exec: JobExecution,
}

impl PartialEq for QueuedExecution {
    fn eq(&self, other: &Self) -> bool {
        self.exec.priority == other.exec.priority && self.seq == other.seq
    }
}
impl Eq for QueuedExecution {}

impl PartialOrd for QueuedExecution {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedExecution {
    /// Higher priority first; FIFO (lower `seq`) among equal priorities
    /// (spec §4.4, §8 property 4). `BinaryHeap` is a max-heap, so ties
    /// invert `seq` to make the *smaller* sequence number compare
    /// greater.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.exec
            .priority
            .cmp(&other.exec.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct PriorityQueue {
    heap: Mutex<BinaryHeap<QueuedExecution>>,
    depth: AtomicUsize,
    max_depth: usize,
    next_seq: AtomicU64,
    notify: Notify,
}

impl PriorityQueue {
    fn new(max_depth: usize) -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
            depth: AtomicUsize::new(0),
            max_depth,
            next_seq: AtomicU64::new(0),
            notify: Notify::new(),
        }
    }

    fn push(&self, exec: JobExecution) -> std::result::Result<(), DataHubError> {
        let mut heap = self.heap.lock().expect("queue lock poisoned");
        if heap.len() >= self.max_depth {
            return Err(DataHubError::QueueFull {
                depth: heap.len(),
                max: self.max_depth,
            });
        }
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        heap.push(QueuedExecution { seq, exec });
        self.depth.store(heap.len(), Ordering::Relaxed);
        drop(heap);
        self.notify.notify_one();
        Ok(())
    }

    fn try_pop(&self) -> Option<JobExecution> {
        let mut heap = self.heap.lock().expect("queue lock poisoned");
        let item = heap.pop().map(|q| q.exec);
        self.depth.store(heap.len(), Ordering::Relaxed);
        item
    }

    /// Waits for an item or for `shutdown` to fire, whichever first.
    async fn pop(&self, shutdown: &CancellationToken) -> Option<JobExecution> {
        loop {
            if let Some(exec) = self.try_pop() {
                return Some(exec);
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = shutdown.cancelled() => return None,
            }
        }
    }

    fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }
}

/// Counters and rolling duration average (spec §3 "PoolStats/Metrics").
struct StatsInner {
    submissions: AtomicU64,
    rejections: AtomicU64,
    failures: AtomicU64,
    scaling_events: AtomicU64,
    active_workers: AtomicUsize,
    total_workers: AtomicUsize,
    durations: Mutex<std::collections::VecDeque<Duration>>,
}

const DURATION_RING_CAPACITY: usize = 1_000;

impl StatsInner {
    fn new() -> Self {
        Self {
            submissions: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            scaling_events: AtomicU64::new(0),
            active_workers: AtomicUsize::new(0),
            total_workers: AtomicUsize::new(0),
            durations: Mutex::new(std::collections::VecDeque::with_capacity(
                DURATION_RING_CAPACITY,
            )),
        }
    }

    fn record_duration(&self, d: Duration) {
        let mut ring = self.durations.lock().expect("duration ring poisoned");
        if ring.len() == DURATION_RING_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(d);
    }

    fn average_duration(&self) -> Duration {
        let ring = self.durations.lock().expect("duration ring poisoned");
        if ring.is_empty() {
            return Duration::ZERO;
        }
        let total: Duration = ring.iter().sum();
        total / ring.len() as u32
    }
}

/// Snapshot of pool health for the scaler and for monitoring UIs.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub total_workers: usize,
    pub active_workers: usize,
    pub queue_depth: usize,
    pub submissions: u64,
    pub rejections: u64,
    pub failures: u64,
    pub scaling_events: u64,
    pub average_task_duration: Duration,
}

struct WorkerHandle {
    index: usize,
    shutdown: CancellationToken,
    join: JoinHandle<()>,
}

/// Holds the bounded priority queue and the dynamic worker roster
/// exclusively (spec §3 "Ownership").
pub struct WorkerPool {
    queue: Arc<PriorityQueue>,
    roster: Mutex<Vec<WorkerHandle>>,
    stats: Arc<StatsInner>,
    root_shutdown: CancellationToken,
    min_size: usize,
    max_size: usize,
    next_index: AtomicUsize,
    on_complete: CompletionSink,
}

impl WorkerPool {
    /// Builds a pool and spawns `initial_size` workers immediately.
    pub fn start(
        initial_size: usize,
        min_size: usize,
        max_size: usize,
        max_queue_depth: usize,
        on_complete: CompletionSink,
    ) -> Arc<Self> {
        let pool = Arc::new(Self {
            queue: Arc::new(PriorityQueue::new(max_queue_depth)),
            roster: Mutex::new(Vec::new()),
            stats: Arc::new(StatsInner::new()),
            root_shutdown: CancellationToken::new(),
            min_size,
            max_size,
            next_index: AtomicUsize::new(0),
            on_complete,
        });
        for _ in 0..initial_size {
            pool.spawn_worker();
        }
        pool
    }

    /// Inserts in priority order; FIFO among equal priorities (spec
    /// §4.4 `Submit`). Fails with `QueueFull` at capacity.
    pub fn submit(&self, exec: JobExecution) -> Result<()> {
        self.stats.submissions.fetch_add(1, Ordering::Relaxed);
        match self.queue.push(exec) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_workers: self.stats.total_workers.load(Ordering::Relaxed),
            active_workers: self.stats.active_workers.load(Ordering::Relaxed),
            queue_depth: self.queue.depth(),
            submissions: self.stats.submissions.load(Ordering::Relaxed),
            rejections: self.stats.rejections.load(Ordering::Relaxed),
            failures: self.stats.failures.load(Ordering::Relaxed),
            scaling_events: self.stats.scaling_events.load(Ordering::Relaxed),
            average_task_duration: self.stats.average_duration(),
        }
    }

    /// Resizes the roster toward `new_n`, clamped to `[min_size,
    /// max_size]` (spec §4.4 `Resize`). Scale-up spawns workers
    /// immediately; scale-down signals the excess workers to exit after
    /// their current job, never mid-task (spec §9 Open Question iii).
    pub fn resize(self: &Arc<Self>, new_n: usize) {
        let new_n = new_n.clamp(self.min_size, self.max_size);
        let current = self.stats.total_workers.load(Ordering::Relaxed);
        if new_n == current {
            return;
        }
        self.stats.scaling_events.fetch_add(1, Ordering::Relaxed);
        if new_n > current {
            info!(from = current, to = new_n, "scaling worker pool up");
            for _ in current..new_n {
                self.spawn_worker();
            }
        } else {
            info!(from = current, to = new_n, "scaling worker pool down");
            let mut roster = self.roster.lock().expect("roster lock poisoned");
            for handle in roster.iter_mut().rev().take(current - new_n) {
                handle.shutdown.cancel();
            }
        }
    }

    /// Replaces the worker at `index` with a fresh one that inherits
    /// the shared queue (spec §4.5 `HealthChecker`). Used when a
    /// worker is classified unhealthy.
    pub fn replace_worker(self: &Arc<Self>, index: usize) {
        {
            let roster = self.roster.lock().expect("roster lock poisoned");
            if let Some(handle) = roster.iter().find(|h| h.index == index) {
                handle.shutdown.cancel();
            }
        }
        self.spawn_worker_at(index);
    }

    fn spawn_worker(self: &Arc<Self>) {
        let index = self.next_index.fetch_add(1, Ordering::Relaxed);
        self.spawn_worker_at(index);
    }

    fn spawn_worker_at(self: &Arc<Self>, index: usize) {
        let shutdown = CancellationToken::new();
        let pool = Arc::clone(self);
        let worker_shutdown = shutdown.clone();
        self.stats.total_workers.fetch_add(1, Ordering::Relaxed);
        let join = tokio::spawn(async move {
            pool.worker_loop(index, worker_shutdown).await;
        });
        let mut roster = self.roster.lock().expect("roster lock poisoned");
        roster.retain(|h| h.index != index);
        roster.push(WorkerHandle {
            index,
            shutdown,
            join,
        });
    }

    async fn worker_loop(self: Arc<Self>, index: usize, shutdown: CancellationToken) {
        let root_shutdown = self.root_shutdown.clone();
        loop {
            if shutdown.is_cancelled() || root_shutdown.is_cancelled() {
                break;
            }
            let combined = shutdown.clone();
            let exec = tokio::select! {
                e = self.queue.pop(&combined) => e,
                _ = root_shutdown.cancelled() => None,
            };
            let Some(exec) = exec else { break };
            self.stats.active_workers.fetch_add(1, Ordering::Relaxed);
            self.run_execution(index, exec).await;
            self.stats.active_workers.fetch_sub(1, Ordering::Relaxed);
        }
        self.stats.total_workers.fetch_sub(1, Ordering::Relaxed);
        info!(worker = index, "worker exited");
    }

    /// Runs one job to completion inside its own spawned task so a
    /// panic is caught by the `JoinHandle` instead of killing this
    /// worker's loop (spec §4.4 "Panic isolation", §8 property 7).
    async fn run_execution(&self, worker_index: usize, exec: JobExecution) {
        let job_id = exec.job_id.clone();
        let deadline = exec.deadline;
        let cancellation = exec.cancellation.clone();
        let body = exec.body;
        let ctx = JobContext {
            cancellation: cancellation.clone(),
            pause: exec.pause,
            progress: exec.progress,
        };

        if let Some(on_start) = exec.on_start {
            on_start(worker_index, job_id.clone());
        }

        let start = Instant::now();
        let run = tokio::spawn(async move { body.execute(ctx).await });

        let outcome_result = match tokio::time::timeout(deadline, run).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(join_err)) if join_err.is_panic() => {
                error!(job_id = %job_id, "job panicked");
                Err(DataHubError::Panic(format!(
                    "job {job_id} panicked: {join_err}"
                )))
            }
            Ok(Err(join_err)) => Err(DataHubError::ExecutionFailure(join_err.to_string())),
            Err(_) => {
                warn!(job_id = %job_id, ?deadline, "job exceeded deadline");
                cancellation.cancel();
                Err(DataHubError::Cancelled {
                    reason: CancelReason::Timeout(deadline),
                })
            }
        };

        let duration = start.elapsed();
        self.stats.record_duration(duration);
        if outcome_result.is_err() {
            self.stats.failures.fetch_add(1, Ordering::Relaxed);
        }
        (self.on_complete)(JobOutcome {
            job_id,
            result: outcome_result,
            duration,
            worker_index,
        });
    }

    /// Cancels the root context, stops accepting new dispatch, and
    /// waits for every worker with a bounded timeout (spec §4.4
    /// `Shutdown`). Returns `true` if every worker stopped in time.
    pub async fn stop(&self, timeout: Duration) -> bool {
        self.root_shutdown.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut roster = self.roster.lock().expect("roster lock poisoned");
            roster.drain(..).map(|h| h.join).collect()
        };
        let join_all = futures::future::join_all(handles);
        match tokio::time::timeout(timeout, join_all).await {
            Ok(_) => true,
            Err(_) => {
                warn!("worker pool shutdown timed out; abandoning remaining workers");
                false
            }
        }
    }
}
