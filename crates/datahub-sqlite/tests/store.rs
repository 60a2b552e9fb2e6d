//! Round-trips `Job`/`Progress`/`Event` through a real SQLite file,
//! exercising migration and the upsert-by-id persistence path.

use std::collections::HashMap;

use datahub_core::event::{Event, EventKind};
use datahub_core::job::{Job, JobKind, JobSpec, JobState};
use datahub_core::progress::Progress;
use datahub_core::store::{JobStore, ListFilter};

async fn open_temp_store(dir: &tempfile::TempDir) -> datahub_sqlite::SqliteStore {
    let path = dir.path().join("jobs.db");
    datahub_sqlite::open(
        &format!("sqlite://{}", path.display()),
        4,
        std::time::Duration::from_secs(5),
    )
    .await
    .expect("opening a fresh sqlite store should succeed")
}

#[tokio::test]
async fn migrate_then_save_and_load_round_trips_a_job() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_temp_store(&dir).await;

    let spec = JobSpec::new("job-1", JobKind::Download)
        .with_priority(7)
        .with_description("nightly pull")
        .with_created_by("scheduler");
    let job = Job::from_spec(spec);
    store.save(&job).await.unwrap();

    let loaded = store.load("job-1").await.unwrap().expect("job should be present");
    assert_eq!(loaded.id, "job-1");
    assert_eq!(loaded.kind, JobKind::Download);
    assert_eq!(loaded.priority, 7);
    assert_eq!(loaded.state, JobState::Submitted);
    assert_eq!(loaded.description, "nightly pull");
    assert_eq!(loaded.created_by, "scheduler");
}

#[tokio::test]
async fn save_upserts_by_id_rather_than_duplicating_rows() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_temp_store(&dir).await;

    let mut job = Job::from_spec(JobSpec::new("job-2", JobKind::Export));
    store.save(&job).await.unwrap();

    job.state = JobState::Running;
    job.retry_count = 1;
    store.save(&job).await.unwrap();

    let all = store.list(&ListFilter::default()).await.unwrap();
    assert_eq!(all.iter().filter(|j| j.id == "job-2").count(), 1);
    let reloaded = store.load("job-2").await.unwrap().unwrap();
    assert_eq!(reloaded.state, JobState::Running);
    assert_eq!(reloaded.retry_count, 1);
}

#[tokio::test]
async fn progress_and_events_persist_independently_of_the_job_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_temp_store(&dir).await;

    let job = Job::from_spec(JobSpec::new("job-3", JobKind::Maintenance));
    store.save(&job).await.unwrap();

    let mut progress = Progress::restored("job-3".to_string(), 40, 100);
    progress.percentage = 40.0;
    store.save_progress(&progress).await.unwrap();

    let loaded_progress = store
        .load_progress("job-3")
        .await
        .unwrap()
        .expect("progress row should exist");
    assert_eq!(loaded_progress.current, 40);
    assert_eq!(loaded_progress.total, 100);

    store
        .append_event(&Event::new("job-3", EventKind::Started, "started"))
        .await
        .unwrap();
    store
        .append_event(&Event::new("job-3", EventKind::Completed, "completed"))
        .await
        .unwrap();

    // No direct "events_for" reader on the trait, but a second
    // `append_event` call failing would surface as an `Err` above —
    // the assertion here is just that both writes succeeded against
    // the same job id without a unique-constraint collision.
    let _ = HashMap::<String, ()>::new();
}

#[tokio::test]
async fn list_filters_by_state() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_temp_store(&dir).await;

    let mut running = Job::from_spec(JobSpec::new("running-job", JobKind::Download));
    running.state = JobState::Running;
    store.save(&running).await.unwrap();

    let mut done = Job::from_spec(JobSpec::new("done-job", JobKind::Download));
    done.state = JobState::Completed;
    store.save(&done).await.unwrap();

    let running_only = store
        .list(&ListFilter::with_states(vec![JobState::Running]))
        .await
        .unwrap();
    assert_eq!(running_only.len(), 1);
    assert_eq!(running_only[0].id, "running-job");
}

#[tokio::test]
async fn delete_cascades_the_job_row() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_temp_store(&dir).await;

    let job = Job::from_spec(JobSpec::new("to-delete", JobKind::Export));
    store.save(&job).await.unwrap();
    assert!(store.load("to-delete").await.unwrap().is_some());

    store.delete("to-delete").await.unwrap();
    assert!(store.load("to-delete").await.unwrap().is_none());
}
