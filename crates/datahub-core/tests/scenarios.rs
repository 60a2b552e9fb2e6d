//! End-to-end scenarios against a real `JobManager`, backed entirely by
//! in-memory doubles: the literal S1/S2/S3/S5 scenarios plus the
//! boundary behaviors spec §8 names.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use datahub_core::event::EventKind;
use datahub_core::job::{CommandRegistry, JobKind, JobSpec, JobState};
use datahub_core::progress::ProgressTracker;
use datahub_core::store::ListFilter;
use datahub_core::{DataHubConfig, JobManager};
use datahub_testing::{InMemoryJobStore, ScriptedJob};

/// Builds a `JobManager` with a `Maintenance`-kind registry that reads
/// a `scenario` metadata key and produces the matching `ScriptedJob`.
/// Not a production factory — just enough indirection for these tests
/// to pick a script per submission.
fn manager_with_scripts(config: DataHubConfig) -> Arc<JobManager> {
    let store = Arc::new(InMemoryJobStore::new());
    let progress = Arc::new(ProgressTracker::new());
    let mut registry = CommandRegistry::new();
    registry.register(JobKind::Maintenance, |spec: &JobSpec| {
        let scripted = match spec.metadata.get("scenario").and_then(|v| v.as_str()) {
            Some("completes") => {
                ScriptedJob::completes_in_steps(10, 10, Duration::from_millis(20))
            }
            Some("forever_100ms") => ScriptedJob::reports_forever(Duration::from_millis(100)),
            Some("panics_50ms") => ScriptedJob::panics_after(Duration::from_millis(50)),
            Some("long") => ScriptedJob::reports_forever(Duration::from_millis(500)),
            other => panic!("unhandled test scenario: {other:?}"),
        };
        Ok(Arc::new(scripted) as Arc<dyn datahub_core::job::JobBody>)
    });
    JobManager::new(store, progress, registry, config)
}

fn spec(id: &str, priority: i32, scenario: &str) -> JobSpec {
    let mut s = JobSpec::new(id, JobKind::Maintenance).with_priority(priority);
    s.metadata.insert("scenario".into(), json!(scenario));
    s
}

#[tokio::test(flavor = "multi_thread")]
async fn s1_submit_and_complete() {
    let manager = manager_with_scripts(DataHubConfig::default());
    manager.spawn_background_loops();

    let job = manager.submit(spec("dj1", 5, "completes")).await.unwrap();

    let mut completed = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if manager.get(&job.id).await.unwrap().state == JobState::Completed {
            completed = true;
            break;
        }
    }
    assert!(completed, "job should reach Completed");

    let final_job = manager.get(&job.id).await.unwrap();
    assert_eq!(final_job.state, JobState::Completed);
    assert_eq!(final_job.retry_count, 0);
    let progress = manager.progress(&job.id).expect("progress retained");
    assert_eq!(progress.percentage, 100.0);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s2_priority_queueing() {
    let mut config = DataHubConfig::default();
    config.pool.default_size = 1;
    config.pool.min_size = 1;
    config.pool.max_size = 1;
    let manager = manager_with_scripts(config);
    manager.spawn_background_loops();

    // Occupies the sole worker.
    manager.submit(spec("blocker", 5, "long")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    manager.submit(spec("low", 1, "completes")).await.unwrap();
    manager.submit(spec("high", 10, "completes")).await.unwrap();

    manager.cancel("blocker").await.unwrap();

    let mut high_started_at = None;
    let mut low_started_at = None;
    for i in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if high_started_at.is_none() && manager.get("high").await.unwrap().started_at.is_some() {
            high_started_at = Some(i);
        }
        if low_started_at.is_none() && manager.get("low").await.unwrap().started_at.is_some() {
            low_started_at = Some(i);
        }
        if high_started_at.is_some() && low_started_at.is_some() {
            break;
        }
    }
    assert!(high_started_at.is_some(), "high priority job should start");
    assert!(low_started_at.is_some(), "low priority job should start");
    assert!(
        high_started_at.unwrap() <= low_started_at.unwrap(),
        "high priority job must start no later than low priority job"
    );

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s3_cancel_mid_flight() {
    let manager = manager_with_scripts(DataHubConfig::default());
    manager.spawn_background_loops();

    let job = manager.submit(spec("dj3", 5, "forever_100ms")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    manager.cancel(&job.id).await.unwrap();

    let mut cancelled = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if manager.get(&job.id).await.unwrap().state == JobState::Cancelled {
            cancelled = true;
            break;
        }
    }
    assert!(cancelled, "job should reach Cancelled within the grace period");

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn s5_panic_isolation() {
    let mut config = DataHubConfig::default();
    config.pool.default_size = 2;
    config.pool.min_size = 2;
    config.pool.max_size = 2;
    let manager = manager_with_scripts(config);
    manager.spawn_background_loops();

    let panicking = manager.submit(spec("panics", 5, "panics_50ms")).await.unwrap();
    let survivor = manager.submit(spec("survivor", 5, "completes")).await.unwrap();

    let mut panic_failed = false;
    let mut survivor_completed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if manager.get(&panicking.id).await.unwrap().state == JobState::Failed {
            panic_failed = true;
        }
        if manager.get(&survivor.id).await.unwrap().state == JobState::Completed {
            survivor_completed = true;
        }
        if panic_failed && survivor_completed {
            break;
        }
    }
    assert!(panic_failed, "panicking job should transition to Failed");
    assert!(survivor_completed, "sibling job should complete normally");

    let panicked_job = manager.get(&panicking.id).await.unwrap();
    assert!(panicked_job.last_error.unwrap().contains("panic"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(manager.pool_stats().active_workers, 0);

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn retry_beyond_max_retries_is_invalid() {
    let mut config = DataHubConfig::default();
    config.pool.default_size = 1;
    let manager = manager_with_scripts(config);
    manager.spawn_background_loops();

    let mut job_spec = spec("will-fail", 5, "panics_50ms");
    job_spec.max_retries = 0;
    let job = manager.submit(job_spec).await.unwrap();

    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if manager.get(&job.id).await.unwrap().state == JobState::Failed {
            break;
        }
    }
    assert_eq!(manager.get(&job.id).await.unwrap().state, JobState::Failed);

    let err = manager.retry(&job.id).await.unwrap_err();
    assert!(matches!(err, datahub_core::DataHubError::InvalidState { .. }));

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn pause_of_non_running_job_is_invalid() {
    let manager = manager_with_scripts(DataHubConfig::default());
    let job = manager.submit(spec("dj-pause", 5, "completes")).await.unwrap();

    // Immediately after submit the job may still be Queued; force it by
    // not running background loops (no worker dequeues without one) —
    // the pool still has its built-in workers, so drive the race out by
    // pausing a job we know is terminal instead: complete it, then try.
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if manager.get(&job.id).await.unwrap().state == JobState::Completed {
            break;
        }
    }
    let err = manager.pause(&job.id).await.unwrap_err();
    assert!(matches!(err, datahub_core::DataHubError::InvalidState { .. }));

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn list_reflects_recovery_after_simulated_restart() {
    let store = Arc::new(InMemoryJobStore::new());
    let progress = Arc::new(ProgressTracker::new());
    let mut registry = CommandRegistry::new();
    registry.register(JobKind::Maintenance, |_: &JobSpec| {
        Ok(Arc::new(ScriptedJob::reports_forever(Duration::from_millis(500)))
            as Arc<dyn datahub_core::job::JobBody>)
    });

    // Simulate a job a prior process left `Running` with no live worker.
    let mut job = datahub_core::job::Job::from_spec(JobSpec::new("stale", JobKind::Maintenance));
    job.state = JobState::Running;
    store.save(&job).await.unwrap();

    let manager = JobManager::new(store, progress, registry, DataHubConfig::default());
    let recovered = manager.recover().await.unwrap();
    assert_eq!(recovered, 1);

    let jobs = manager
        .list(&ListFilter::with_states(vec![JobState::Queued, JobState::Running]))
        .await
        .unwrap();
    assert!(jobs.iter().any(|j| j.id == "stale" && j.state == JobState::Queued));

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn queue_full_is_rejected() {
    let mut config = DataHubConfig::default();
    config.pool.default_size = 1;
    config.pool.min_size = 1;
    config.pool.max_size = 1;
    config.pool.queue_size = 1;
    let manager = manager_with_scripts(config);

    manager.submit(spec("occupy", 5, "long")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    manager.submit(spec("fills-queue", 5, "long")).await.unwrap();

    let err = manager.submit(spec("overflow", 5, "long")).await.unwrap_err();
    assert!(matches!(err, datahub_core::DataHubError::QueueFull { .. }));

    manager.shutdown(Duration::from_secs(5)).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn event_log_ends_in_a_terminal_event_with_no_spurious_completion() {
    let store = Arc::new(InMemoryJobStore::new());
    let progress = Arc::new(ProgressTracker::new());
    let mut registry = CommandRegistry::new();
    registry.register(JobKind::Maintenance, |_: &JobSpec| {
        Ok(Arc::new(ScriptedJob::reports_forever(Duration::from_millis(100)))
            as Arc<dyn datahub_core::job::JobBody>)
    });
    let manager = JobManager::new(store.clone(), progress, registry, DataHubConfig::default());
    manager.spawn_background_loops();

    let job = manager.submit(JobSpec::new("dj-events", JobKind::Maintenance)).await.unwrap();
    tokio::time::sleep(Duration::from_millis(350)).await;
    manager.cancel(&job.id).await.unwrap();

    let mut cancelled = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(10)).await;
        if manager.get(&job.id).await.unwrap().state == JobState::Cancelled {
            cancelled = true;
            break;
        }
    }
    assert!(cancelled);

    let events = store.events_for(&job.id);
    assert!(!events.is_empty());
    assert_eq!(events.last().unwrap().kind, EventKind::Cancelled);
    assert!(!events.iter().any(|e| e.kind == EventKind::Completed));

    manager.shutdown(Duration::from_secs(5)).await;
}
