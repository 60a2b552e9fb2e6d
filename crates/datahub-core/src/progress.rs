//! Per-job progress with a bounded rate window, percentage, and ETA
//! derivation (spec §3 "Progress", §4.6, §9 "Progress rate window").

use std::collections::VecDeque;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Capacity of the sliding sample window (spec §3: "bounded ... capacity 30").
pub const WINDOW_CAPACITY: usize = 30;

/// One `(count, timestamp)` sample in the rate window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Sample {
    pub count: u64,
    pub at: DateTime<Utc>,
}

/// Progress for one active or recently-active job (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Progress {
    pub job_id: String,
    pub current: u64,
    pub total: u64,
    pub message: String,
    pub start_time: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub window: VecDeque<Sample>,
    pub percentage: f64,
    pub rate_per_sec: f64,
    pub eta_seconds: Option<f64>,
    pub completed: bool,
}

impl Progress {
    /// Reconstructs a snapshot loaded from durable storage. The sample
    /// window starts empty: rate/ETA only reflect updates observed
    /// after this process started, which is acceptable since a
    /// restarted job's prior rate says nothing about its new worker.
    pub fn restored(job_id: String, current: u64, total: u64) -> Self {
        let mut progress = Self::new(job_id);
        progress.current = current;
        progress.total = total;
        progress
    }

    fn new(job_id: String) -> Self {
        let now = Utc::now();
        Progress {
            job_id,
            current: 0,
            total: 0,
            message: String::new(),
            start_time: now,
            last_update: now,
            window: VecDeque::with_capacity(WINDOW_CAPACITY),
            percentage: 0.0,
            rate_per_sec: 0.0,
            eta_seconds: None,
            completed: false,
        }
    }

    fn push_sample(&mut self, count: u64, at: DateTime<Utc>) {
        if self.window.len() == WINDOW_CAPACITY {
            self.window.pop_front();
        }
        self.window.push_back(Sample { count, at });
    }

    /// Recompute rate from the oldest and newest sample in the window
    /// (spec §4.6: "Δcount/Δtime, 0 when Δtime ≤ 0 or fewer than 2
    /// samples").
    fn recompute_rate(&mut self) {
        self.rate_per_sec = match (self.window.front(), self.window.back()) {
            (Some(first), Some(last)) if self.window.len() >= 2 => {
                let dt = (last.at - first.at).num_milliseconds() as f64 / 1000.0;
                let dc = last.count.saturating_sub(first.count) as f64;
                if dt > 0.0 {
                    dc / dt
                } else {
                    0.0
                }
            }
            _ => 0.0,
        };
    }

    fn recompute_percentage(&mut self) {
        self.percentage = if self.completed {
            100.0
        } else if self.total > 0 {
            (self.current as f64 / self.total as f64 * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    fn recompute_eta(&mut self) {
        self.eta_seconds = if self.completed || self.rate_per_sec <= 0.0 || self.total == 0 {
            None
        } else {
            let remaining = self.total.saturating_sub(self.current) as f64;
            Some(remaining / self.rate_per_sec)
        };
    }
}

type Callback = Arc<dyn Fn(Progress) + Send + Sync>;

struct Entry {
    progress: Progress,
    subscribers: Vec<Callback>,
}

/// Owns the progress map exclusively (spec §3 "Ownership"). Cross-job
/// reads/writes happen only through the methods below.
pub struct ProgressTracker {
    entries: DashMap<String, Entry>,
    global_subscribers: RwLock<Vec<Callback>>,
    persist: Option<Arc<dyn ProgressPersistence>>,
}

/// Optional persistence hook (spec §4.6 "Persistence (optional mode)").
/// Kept separate from the concrete `JobStore` trait in `store` so the
/// tracker does not need to know about connection pooling at all.
#[async_trait::async_trait]
pub trait ProgressPersistence: Send + Sync {
    async fn save_progress(&self, progress: &Progress);
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            global_subscribers: RwLock::new(Vec::new()),
            persist: None,
        }
    }

    pub fn with_persistence(persist: Arc<dyn ProgressPersistence>) -> Self {
        Self {
            entries: DashMap::new(),
            global_subscribers: RwLock::new(Vec::new()),
            persist: Some(persist),
        }
    }

    /// Register a callback invoked asynchronously on every update for
    /// every job (spec §4.6 `Subscribe`). A slow callback must not block
    /// the tracker: dispatch is fire-and-forget with the snapshot value.
    pub fn subscribe<F>(&self, callback: F)
    where
        F: Fn(Progress) + Send + Sync + 'static,
    {
        self.global_subscribers
            .write()
            .expect("progress subscriber lock poisoned")
            .push(Arc::new(callback));
    }

    /// Start tracking a job, or reset it if already present.
    pub fn start(&self, job_id: &str) {
        self.entries.insert(
            job_id.to_string(),
            Entry {
                progress: Progress::new(job_id.to_string()),
                subscribers: Vec::new(),
            },
        );
    }

    /// Append a sample, recompute percentage/rate/ETA, and fan out to
    /// subscribers (spec §4.6 `Update`).
    pub fn update(&self, job_id: &str, current: u64, message: impl Into<String>) {
        let snapshot = {
            let mut entry = self
                .entries
                .entry(job_id.to_string())
                .or_insert_with(|| Entry {
                    progress: Progress::new(job_id.to_string()),
                    subscribers: Vec::new(),
                });
            let now = Utc::now();
            entry.progress.current = current;
            entry.progress.message = message.into();
            entry.progress.last_update = now;
            entry.progress.push_sample(current, now);
            entry.progress.recompute_rate();
            entry.progress.recompute_percentage();
            entry.progress.recompute_eta();
            entry.progress.clone()
        };
        trace!(job_id, current, "progress update");
        self.dispatch(job_id, snapshot);
    }

    /// Retroactively recompute percentage against a newly-known total
    /// (spec §4.6 `SetTotal`).
    pub fn set_total(&self, job_id: &str, total: u64) {
        let snapshot = {
            let mut entry = match self.entries.get_mut(job_id) {
                Some(e) => e,
                None => return,
            };
            entry.progress.total = total;
            entry.progress.recompute_percentage();
            entry.progress.recompute_eta();
            entry.progress.clone()
        };
        self.dispatch(job_id, snapshot);
    }

    /// Force `current = total`, `percentage = 100`, ETA cleared (spec
    /// §4.6 `Complete`).
    pub fn complete(&self, job_id: &str) {
        let snapshot = {
            let mut entry = match self.entries.get_mut(job_id) {
                Some(e) => e,
                None => return,
            };
            entry.progress.completed = true;
            if entry.progress.total > 0 {
                entry.progress.current = entry.progress.total;
            }
            entry.progress.recompute_percentage();
            entry.progress.eta_seconds = None;
            entry.progress.clone()
        };
        self.dispatch(job_id, snapshot);
    }

    pub fn get(&self, job_id: &str) -> Option<Progress> {
        self.entries.get(job_id).map(|e| e.progress.clone())
    }

    pub fn remove(&self, job_id: &str) {
        self.entries.remove(job_id);
    }

    fn dispatch(&self, job_id: &str, snapshot: Progress) {
        let global = self
            .global_subscribers
            .read()
            .expect("progress subscriber lock poisoned")
            .clone();
        let per_job = self
            .entries
            .get(job_id)
            .map(|e| e.subscribers.clone())
            .unwrap_or_default();
        for cb in global.into_iter().chain(per_job) {
            let snap = snapshot.clone();
            tokio::spawn(async move {
                cb(snap);
            });
        }
        if let Some(persist) = self.persist.clone() {
            let snap = snapshot;
            tokio::spawn(async move {
                persist.save_progress(&snap).await;
            });
        }
    }

    /// A handle a job body can use to report progress without holding
    /// a reference to the whole tracker's internals.
    pub fn handle(self: &Arc<Self>, job_id: impl Into<String>) -> ProgressHandle {
        let job_id = job_id.into();
        self.start(&job_id);
        ProgressHandle {
            tracker: Arc::clone(self),
            job_id,
        }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Callback signature for `ProgressTracker::subscribe` (spec §6
/// `ProgressCallback`).
pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// A job-scoped handle bound to one job id, handed to job bodies via
/// `JobContext` (spec §4.7 `progressFn`).
#[derive(Clone)]
pub struct ProgressHandle {
    tracker: Arc<ProgressTracker>,
    job_id: String,
}

impl ProgressHandle {
    pub fn report(&self, current: u64, message: impl Into<String>) {
        self.tracker.update(&self.job_id, current, message);
    }

    pub fn set_total(&self, total: u64) {
        self.tracker.set_total(&self.job_id, total);
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }
}

/// A lightweight rate-limited wall-clock guard used by jobs that need
/// to throttle how often they call `report` (e.g. `ExportJob` reporting
/// every 1,000 rows still wants a time-based floor so a fast store
/// doesn't flood the tracker). Not part of the spec's public surface;
/// an internal convenience used by the concrete job kinds.
pub struct ReportThrottle {
    every: Duration,
    last: Instant,
}

impl ReportThrottle {
    pub fn new(every: Duration) -> Self {
        Self {
            every,
            last: Instant::now() - every,
        }
    }

    pub fn ready(&mut self) -> bool {
        if self.last.elapsed() >= self.every {
            self.last = Instant::now();
            true
        } else {
            false
        }
    }
}
