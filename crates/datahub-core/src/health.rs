//! Adaptive sizing and admission control: `HealthChecker`, `Scaler`,
//! and `ResourceMonitor` (spec §4.5).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sysinfo::{Pid, System};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{ResourceLimits, SchedulerConfig};
use crate::pool::{PoolStats, WorkerPool};

/// Tracks process-level resource usage and implements admission control
/// (spec §4.5 `ResourceMonitor`). `CanAccept` is checked by the manager
/// before a submission is enqueued.
pub struct ResourceMonitor {
    limits: ResourceLimits,
    system: Mutex<System>,
    pid: Pid,
    last_cpu_percent: AtomicUsize,
    last_memory_mib: AtomicUsize,
}

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        let pid = Pid::from_u32(std::process::id());
        let mut system = System::new();
        system.refresh_all();
        Self {
            limits,
            system: Mutex::new(system),
            pid,
            last_cpu_percent: AtomicUsize::new(0),
            last_memory_mib: AtomicUsize::new(0),
        }
    }

    /// Re-samples process CPU/memory. Cheap enough to call from the
    /// health loop every `healthInterval`.
    pub fn refresh(&self) {
        let mut system = self.system.lock().expect("sysinfo lock poisoned");
        system.refresh_process(self.pid);
        if let Some(proc_) = system.process(self.pid) {
            self.last_cpu_percent
                .store(proc_.cpu_usage() as usize, Ordering::Relaxed);
            self.last_memory_mib
                .store((proc_.memory() / 1024 / 1024) as usize, Ordering::Relaxed);
        }
    }

    pub fn cpu_percent(&self) -> f32 {
        self.last_cpu_percent.load(Ordering::Relaxed) as f32
    }

    pub fn memory_mib(&self) -> u64 {
        self.last_memory_mib.load(Ordering::Relaxed) as u64
    }

    /// Admission control: denies when any configured limit is exceeded
    /// (spec §4.5 `CanAccept`). Callers map a `false` result to
    /// `ResourceExhausted`.
    pub fn can_accept(&self, current_queue_depth: usize, current_tasks: usize) -> bool {
        self.cpu_percent() <= self.limits.max_cpu_percent
            && self.memory_mib() <= self.limits.max_memory_mib
            && current_queue_depth <= self.limits.max_queue_depth
            && current_tasks <= self.limits.max_tasks
    }
}

/// A worker's perceived health, sampled at `healthInterval` (spec §4.5
/// `HealthChecker`). Distinct from a persisted `JobState` — this only
/// classifies the *worker*, not the job running inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerHealth {
    Healthy,
    Unhealthy,
}

/// Per-worker bookkeeping the health checker needs to classify a
/// worker: how long it has been on the same job, and whether it
/// panicked recently.
#[derive(Default)]
struct WorkerRecord {
    current_job: Option<String>,
    since: Option<Instant>,
    recent_panic: bool,
}

/// Runs every `health_interval`, classifies each worker, and replaces
/// unhealthy ones at the same roster index (spec §4.5).
pub struct HealthChecker {
    records: Mutex<std::collections::HashMap<usize, WorkerRecord>>,
    stuck_threshold: Duration,
}

impl HealthChecker {
    pub fn new(stuck_threshold: Duration) -> Self {
        Self {
            records: Mutex::new(std::collections::HashMap::new()),
            stuck_threshold,
        }
    }

    /// Called by the pool whenever a worker starts a new job, so the
    /// checker can tell "still on the same job" from "moved on".
    pub fn note_job_started(&self, worker: usize, job_id: &str) {
        let mut records = self.records.lock().expect("health records lock poisoned");
        let record = records.entry(worker).or_default();
        if record.current_job.as_deref() != Some(job_id) {
            record.current_job = Some(job_id.to_string());
            record.since = Some(Instant::now());
        }
    }

    pub fn note_panic(&self, worker: usize) {
        let mut records = self.records.lock().expect("health records lock poisoned");
        records.entry(worker).or_default().recent_panic = true;
    }

    fn classify(&self, worker: usize) -> WorkerHealth {
        let records = self.records.lock().expect("health records lock poisoned");
        match records.get(&worker) {
            Some(r) if r.recent_panic => WorkerHealth::Unhealthy,
            Some(r) => match r.since {
                Some(since) if since.elapsed() > self.stuck_threshold => WorkerHealth::Unhealthy,
                _ => WorkerHealth::Healthy,
            },
            None => WorkerHealth::Healthy,
        }
    }

    /// One sweep: snapshot the roster, classify, replace unhealthy
    /// workers at the same index.
    pub fn sweep(&self, pool: &Arc<WorkerPool>, roster_size: usize) {
        for index in 0..roster_size {
            if self.classify(index) == WorkerHealth::Unhealthy {
                warn!(worker = index, "replacing unhealthy worker");
                pool.replace_worker(index);
                let mut records = self.records.lock().expect("health records lock poisoned");
                records.remove(&index);
            }
        }
    }

    /// Spawns the periodic health loop; returns a token the caller can
    /// cancel to stop it.
    pub fn spawn_loop(
        self: Arc<Self>,
        pool: Arc<WorkerPool>,
        interval: Duration,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let stats = pool.stats();
                        self.sweep(&pool, stats.total_workers);
                    }
                    _ = loop_token.cancelled() => break,
                }
            }
        });
        token
    }
}

/// Sustained-load sample used to evaluate the scaling thresholds over
/// `evaluation_window` (spec §4.5 `Scaler`).
struct LoadSample {
    at: Instant,
    active: usize,
    total: usize,
}

/// Evaluates queue depth vs. active workers over a sliding window and
/// requests resizes, subject to a cooldown that prevents thrash (spec
/// §4.5).
pub struct Scaler {
    config: SchedulerConfig,
    samples: Mutex<VecDeque<LoadSample>>,
    last_scale: Mutex<Option<Instant>>,
    min_size: usize,
    max_size: usize,
}

impl Scaler {
    pub fn new(config: SchedulerConfig, min_size: usize, max_size: usize) -> Self {
        Self {
            config,
            samples: Mutex::new(VecDeque::new()),
            last_scale: Mutex::new(None),
            min_size,
            max_size,
        }
    }

    fn record(&self, stats: &PoolStats) {
        let mut samples = self.samples.lock().expect("scaler samples lock poisoned");
        samples.push_back(LoadSample {
            at: Instant::now(),
            active: stats.active_workers,
            total: stats.total_workers.max(1),
        });
        let window = self.config.evaluation_window;
        while samples
            .front()
            .map(|s| s.at.elapsed() > window)
            .unwrap_or(false)
        {
            samples.pop_front();
        }
    }

    fn sustained_ratio_at_least(&self, threshold: f64) -> bool {
        let samples = self.samples.lock().expect("scaler samples lock poisoned");
        !samples.is_empty()
            && samples
                .iter()
                .all(|s| (s.active as f64 / s.total as f64) >= threshold)
    }

    fn sustained_ratio_at_most(&self, threshold: f64) -> bool {
        let samples = self.samples.lock().expect("scaler samples lock poisoned");
        !samples.is_empty()
            && samples
                .iter()
                .all(|s| (s.active as f64 / s.total as f64) <= threshold)
    }

    fn in_cooldown(&self) -> bool {
        let last = self.last_scale.lock().expect("scaler cooldown lock poisoned");
        matches!(*last, Some(t) if t.elapsed() < self.config.cooldown)
    }

    fn mark_scaled(&self) {
        *self.last_scale.lock().expect("scaler cooldown lock poisoned") = Some(Instant::now());
    }

    /// Records one load sample and, if thresholds are sustained across
    /// the evaluation window and the cooldown has elapsed, resizes the
    /// pool (spec §4.5).
    pub fn evaluate(&self, pool: &Arc<WorkerPool>) {
        let stats = pool.stats();
        self.record(&stats);
        if self.in_cooldown() {
            return;
        }
        if stats.total_workers < self.max_size
            && self.sustained_ratio_at_least(self.config.scale_up_threshold)
        {
            info!(total = stats.total_workers, "scaling up on sustained load");
            pool.resize(stats.total_workers + 1);
            self.mark_scaled();
        } else if stats.total_workers > self.min_size
            && self.sustained_ratio_at_most(self.config.scale_down_threshold)
        {
            info!(total = stats.total_workers, "scaling down on sustained idle");
            pool.resize(stats.total_workers.saturating_sub(1));
            self.mark_scaled();
        }
    }

    /// Spawns the periodic scaling loop.
    pub fn spawn_loop(
        self: Arc<Self>,
        pool: Arc<WorkerPool>,
        interval: Duration,
    ) -> CancellationToken {
        let token = CancellationToken::new();
        let loop_token = token.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.evaluate(&pool),
                    _ = loop_token.cancelled() => break,
                }
            }
        });
        token
    }
}

/// Whether admission control is currently enabled. Exposed as a
/// standalone flag (rather than baked into `ResourceMonitor`) so tests
/// can disable caps without constructing a custom `ResourceLimits`.
pub struct AdmissionGate {
    enabled: AtomicBool,
}

impl AdmissionGate {
    pub fn new() -> Self {
        Self {
            enabled: AtomicBool::new(true),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for AdmissionGate {
    fn default() -> Self {
        Self::new()
    }
}
