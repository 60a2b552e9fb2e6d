//! Invariant-focused unit tests that don't fit naturally inside any
//! single module: state machine legality, queue ordering, and progress
//! math (spec §8 testable properties).

use std::sync::Arc;
use std::time::Duration;

use crate::error::DataHubError;
use crate::job::JobState;
use crate::progress::ProgressTracker;

#[test]
fn state_machine_allows_only_the_documented_edges() {
    use JobState::*;
    let legal = [
        (Submitted, Queued),
        (Queued, Running),
        (Queued, Cancelled),
        (Running, Completed),
        (Running, Failed),
        (Running, Paused),
        (Running, Cancelled),
        (Paused, Running),
        (Paused, Queued),
        (Paused, Cancelled),
        (Failed, Queued),
    ];
    for (from, to) in legal {
        assert!(from.can_transition_to(to), "{from:?} -> {to:?} should be legal");
    }

    // Completed and Cancelled never transition again; Failed's only
    // documented exception is the caller-driven retry back to Queued.
    for to in [Submitted, Queued, Running, Paused, Completed, Failed, Cancelled] {
        assert!(!Completed.can_transition_to(to), "Completed -> {to:?} should not be legal");
        assert!(!Cancelled.can_transition_to(to), "Cancelled -> {to:?} should not be legal");
        if to != Queued {
            assert!(!Failed.can_transition_to(to), "Failed -> {to:?} should not be legal");
        }
    }
    assert!(Failed.can_transition_to(Queued), "retry must be legal from Failed");

    assert!(!Submitted.can_transition_to(Running), "cannot skip Queued");
    assert!(!Queued.can_transition_to(Paused), "cannot pause before running");
}

#[test]
fn terminal_states_are_terminal() {
    assert!(JobState::Completed.is_terminal());
    assert!(JobState::Failed.is_terminal());
    assert!(JobState::Cancelled.is_terminal());
    assert!(!JobState::Running.is_terminal());
    assert!(!JobState::Paused.is_terminal());
}

#[test]
fn error_retryability_matches_taxonomy() {
    assert!(DataHubError::ExecutionFailure("x".into()).is_retryable());
    assert!(DataHubError::ResourceExhausted("x".into()).is_retryable());
    assert!(!DataHubError::ValidationError("x".into()).is_retryable());
    assert!(!DataHubError::NotFound("x".into()).is_retryable());
}

#[tokio::test(flavor = "multi_thread")]
async fn progress_rate_and_eta_derive_from_the_sample_window() {
    let tracker = Arc::new(ProgressTracker::new());
    tracker.start("job-1");
    tracker.set_total("job-1", 100);
    tracker.update("job-1", 0, "starting");
    tokio::time::sleep(Duration::from_millis(5)).await;
    tracker.update("job-1", 50, "halfway");

    let snap = tracker.get("job-1").expect("progress recorded");
    assert_eq!(snap.percentage, 50.0);
    assert!(snap.rate_per_sec > 0.0, "rate should be positive after two samples");
    assert!(snap.eta_seconds.is_some());
}

#[tokio::test(flavor = "multi_thread")]
async fn completing_a_job_clears_eta_and_forces_full_percentage() {
    let tracker = Arc::new(ProgressTracker::new());
    tracker.start("job-2");
    tracker.set_total("job-2", 10);
    tracker.update("job-2", 3, "working");
    tracker.complete("job-2");

    let snap = tracker.get("job-2").expect("progress recorded");
    assert!(snap.completed);
    assert_eq!(snap.percentage, 100.0);
    assert_eq!(snap.current, snap.total);
    assert!(snap.eta_seconds.is_none());
}
