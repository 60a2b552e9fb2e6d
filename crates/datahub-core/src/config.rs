//! Explicit, injected configuration (spec §6, §9 "Global state").
//!
//! Nothing in this crate reads environment variables or files; a
//! collaborator (the out-of-scope config file reader) builds one of
//! these and hands it to `JobManager::new` / `Store::open`.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Connection pool sizing and timeouts (spec §4.1, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub default_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub queue_size: usize,
    #[serde(with = "duration_secs")]
    pub lease_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub job_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub health_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            default_size: cpus,
            min_size: 1,
            max_size: cpus * 4,
            queue_size: 1000,
            lease_timeout: Duration::from_secs(30),
            job_timeout: Duration::from_secs(2 * 3600),
            shutdown_timeout: Duration::from_secs(30),
            health_interval: Duration::from_secs(30),
        }
    }
}

/// Scaler thresholds and cooldown (spec §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub scale_up_threshold: f64,
    pub scale_down_threshold: f64,
    #[serde(with = "duration_secs")]
    pub evaluation_window: Duration,
    #[serde(with = "duration_secs")]
    pub cooldown: Duration,
    /// How often the scaler samples load. Independent of
    /// `evaluation_window`, which is how far back those samples are
    /// kept.
    #[serde(with = "duration_secs")]
    pub tick_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            scale_up_threshold: 0.8,
            scale_down_threshold: 0.2,
            evaluation_window: Duration::from_secs(5 * 60),
            cooldown: Duration::from_secs(2 * 60),
            tick_interval: Duration::from_secs(10),
        }
    }
}

/// Admission-control resource caps (spec §4.5, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_cpu_percent: f32,
    pub max_memory_mib: u64,
    pub max_tasks: usize,
    pub max_queue_depth: usize,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_cpu_percent: 80.0,
            max_memory_mib: 1024,
            max_tasks: 10_000,
            max_queue_depth: 5_000,
        }
    }
}

/// JobManager policy defaults (spec §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub max_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub job_retention: Duration,
    pub persist_progress: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(60),
            cleanup_interval: Duration::from_secs(3600),
            job_retention: Duration::from_secs(24 * 3600),
            persist_progress: true,
        }
    }
}

/// Top-level configuration tree injected into the subsystem at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataHubConfig {
    pub pool: PoolConfig,
    pub scheduler: SchedulerConfig,
    pub resources: ResourceLimits,
    pub manager: ManagerConfig,
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}
