//! Batch runs against the scripted mock scheduler.
//!
//! Tests verify:
//! - results cover every run, in input order
//! - retries are bounded and draw from one attempt counter
//! - success needs both the scheduler and the completion marker
//! - the in-flight ceiling holds
//! - cancellation, fail-fast and timeouts leave runs not completed

use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use corvus_launcher::prelude::*;
use corvus_mock::{MockScheduler, Run, Submit};

// ============================================================================
// Test Helpers
// ============================================================================

/// Temporary batch root, removed when the test ends.
struct Scratch(PathBuf);

impl Drop for Scratch {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.0);
    }
}

impl Deref for Scratch {
    type Target = Path;

    fn deref(&self) -> &Path {
        &self.0
    }
}

fn scratch() -> Scratch {
    let dir = std::env::temp_dir().join(format!("corvus_batch_{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).unwrap();
    Scratch(dir)
}

fn config() -> LauncherConfig {
    LauncherConfig {
        command: vec!["python".into(), "train.py".into()],
        job_name: "train".into(),
        poll_interval: Duration::from_millis(10),
        poll_jitter: 0.0,
        retry_backoff_base: Duration::from_millis(5),
        max_backoff: Duration::from_millis(20),
        min_submit_interval: Duration::ZERO,
        unknown_grace_polls: 2,
        ..Default::default()
    }
}

fn specs(root: &Path, ordinals: impl IntoIterator<Item = usize>) -> Vec<RunSpec> {
    ordinals
        .into_iter()
        .map(|i| RunSpec::new(i, root.join(format!("run_{i}"))).with_param("seed", i.to_string()))
        .collect()
}

fn coordinator(
    scheduler: MockScheduler,
    config: LauncherConfig,
) -> (Arc<MockScheduler>, BatchCoordinator<MockScheduler>) {
    let scheduler = Arc::new(scheduler);
    let coordinator = BatchCoordinator::from_shared(scheduler.clone(), config);
    (scheduler, coordinator)
}

fn failure_kind(outcome: &Outcome) -> Option<FailureKind> {
    match outcome {
        Outcome::Failure(failure) => Some(failure.kind),
        _ => None,
    }
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_results_follow_input_order() {
    let root = scratch();
    let scheduler = MockScheduler::new().script(5, [Submit::Accept(Run::Succeed { polls: 5 })]);
    let (_, coordinator) = coordinator(scheduler, config());

    let specs = specs(&root, [5, 2, 9]);
    let result = coordinator.run(&specs).await.unwrap();

    assert_eq!(result.len(), specs.len());
    let ordinals: Vec<_> = result.entries.iter().map(|e| e.ordinal).collect();
    assert_eq!(ordinals, vec![5, 2, 9]);

    for (entry, spec) in result.entries.iter().zip(&specs) {
        let expected = std::fs::canonicalize(&spec.output_dir).unwrap();
        assert_eq!(entry.outcome, Outcome::Success { path: expected });
        assert_eq!(entry.attempts, 1);
    }
    assert!(result.all_succeeded());
    assert_eq!(result.cancelled, None);
}

#[tokio::test]
async fn test_empty_batch() {
    let (scheduler, coordinator) = coordinator(MockScheduler::new(), config());
    let result = coordinator.run(&[]).await.unwrap();
    assert!(result.is_empty());
    assert_eq!(scheduler.total_submits(), 0);
}

#[tokio::test]
async fn test_output_directory_gets_params() {
    let root = scratch();
    let (_, coordinator) = coordinator(MockScheduler::new(), config());

    let specs = specs(&root, [0]);
    coordinator.run(&specs).await.unwrap();

    let saved = std::fs::read_to_string(specs[0].output_dir.join("params.json")).unwrap();
    let saved: RunSpec = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved.params.get("seed").map(String::as_str), Some("0"));
}

// ============================================================================
// Submission retries
// ============================================================================

#[tokio::test]
async fn test_transient_submission_retries_are_bounded() {
    let root = scratch();
    let scheduler = MockScheduler::new().script(0, std::iter::repeat_n(Submit::Transient, 5));
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 2,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, [0])).await.unwrap();

    assert_eq!(failure_kind(&result.entries[0].outcome), Some(FailureKind::Submission));
    assert_eq!(scheduler.submit_count(0), 3);
    assert_eq!(result.entries[0].attempts, 3);
    assert!(result.entries[0].external_ids.is_empty());
}

#[tokio::test]
async fn test_permanent_submission_error_fails_only_that_job() {
    let root = scratch();
    let scheduler = MockScheduler::new().script(1, [Submit::Permanent]);
    let (scheduler, coordinator) = coordinator(scheduler, config());

    let result = coordinator.run(&specs(&root, [0, 1, 2])).await.unwrap();

    assert!(result.entries[0].outcome.is_success());
    assert_eq!(failure_kind(&result.entries[1].outcome), Some(FailureKind::Submission));
    assert!(result.entries[2].outcome.is_success());
    assert_eq!(scheduler.submit_count(1), 1);
}

#[tokio::test]
async fn test_three_runs_with_one_transient_refusal() {
    let root = scratch();
    let scheduler = MockScheduler::new().script(
        2,
        [Submit::Transient, Submit::Accept(Run::Succeed { polls: 1 })],
    );
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_concurrent: 2,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, [0, 1, 2])).await.unwrap();

    assert!(result.all_succeeded());
    assert_eq!(scheduler.submit_count(2), 2);
    assert_eq!(result.entries[2].attempts, 2);
    assert!(result.peak_in_flight <= 2);
}

// ============================================================================
// Completion marker
// ============================================================================

#[tokio::test]
async fn test_scheduler_success_without_marker_is_failure() {
    let root = scratch();
    let scheduler = MockScheduler::new().with_default(Run::SucceedWithoutMarker);
    let (_, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 0,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, [0])).await.unwrap();

    assert_eq!(failure_kind(&result.entries[0].outcome), Some(FailureKind::Execution));
}

#[tokio::test]
async fn test_execution_failure_is_resubmitted_under_new_id() {
    let root = scratch();
    let scheduler = MockScheduler::new().script(
        0,
        [
            Submit::Accept(Run::Fail { exit_code: 2 }),
            Submit::Accept(Run::Succeed { polls: 1 }),
        ],
    );
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 1,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, [0])).await.unwrap();

    let entry = &result.entries[0];
    assert!(entry.outcome.is_success());
    assert_eq!(entry.attempts, 2);
    assert_eq!(entry.external_ids, scheduler.ids_for(0));
    assert_eq!(entry.external_ids.len(), 2);
    assert_ne!(entry.external_ids[0], entry.external_ids[1]);
}

#[tokio::test]
async fn test_vanished_job_resolved_by_marker() {
    let root = scratch();
    let scheduler = MockScheduler::new()
        .script(0, [Submit::Accept(Run::Vanish { marker: true })])
        .script(1, [Submit::Accept(Run::Vanish { marker: false })]);
    let (_, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 0,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, [0, 1])).await.unwrap();

    assert!(result.entries[0].outcome.is_success());
    assert_eq!(failure_kind(&result.entries[1].outcome), Some(FailureKind::Execution));
}

// ============================================================================
// Throttle
// ============================================================================

#[tokio::test]
async fn test_in_flight_never_exceeds_ceiling() {
    let root = scratch();
    let scheduler = MockScheduler::new().with_default(Run::Succeed { polls: 3 });
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_concurrent: 3,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, 0..8)).await.unwrap();

    assert!(result.all_succeeded());
    assert!(result.peak_in_flight <= 3);
    assert!(scheduler.peak_active() <= 3);
}

// ============================================================================
// Cancellation and timeouts
// ============================================================================

#[tokio::test]
async fn test_cancel_marks_runs_not_completed() {
    let root = scratch();
    let scheduler = MockScheduler::new().with_default(Run::Hang);
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_concurrent: 2,
            ..config()
        },
    );

    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        })
    };

    let result = coordinator
        .run_until(&specs(&root, 0..4), cancel)
        .await
        .unwrap();
    trigger.await.unwrap();

    assert_eq!(result.cancelled, Some(CancelReason::Interrupted));
    assert!(result.outcomes().all(|o| *o == Outcome::NotCompleted));

    let cancelled = scheduler.cancelled();
    for ordinal in 0..4 {
        for id in scheduler.ids_for(ordinal) {
            assert!(cancelled.contains(&id), "cancel() not called for {id}");
        }
    }
    assert_eq!(scheduler.total_submits(), 2);
}

#[tokio::test]
async fn test_stalled_job_times_out() {
    let root = scratch();
    let scheduler = MockScheduler::new().with_default(Run::Hang);
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 0,
            per_job_timeout: Some(Duration::from_millis(50)),
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, [0])).await.unwrap();

    assert_eq!(failure_kind(&result.entries[0].outcome), Some(FailureKind::StallTimeout));
    let ids = scheduler.ids_for(0);
    assert_eq!(ids.len(), 1);
    assert!(scheduler.cancelled().contains(&ids[0]));
}

#[tokio::test]
async fn test_unanswered_poll_does_not_outlive_job_timeout() {
    let root = scratch();
    let scheduler = MockScheduler::new().with_default(Run::Unresponsive);
    let (scheduler, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 0,
            per_job_timeout: Some(Duration::from_millis(100)),
            batch_timeout: Some(Duration::from_secs(1)),
            ..config()
        },
    );

    let result = tokio::time::timeout(Duration::from_secs(3), coordinator.run(&specs(&root, [0])))
        .await
        .expect("batch did not finish")
        .unwrap();

    assert_eq!(failure_kind(&result.entries[0].outcome), Some(FailureKind::StallTimeout));
    assert!(scheduler.cancelled().contains(&scheduler.ids_for(0)[0]));
}

#[tokio::test]
async fn test_batch_timeout_interrupts_unanswered_poll() {
    let root = scratch();
    let scheduler = MockScheduler::new().with_default(Run::Unresponsive);
    let (_, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            batch_timeout: Some(Duration::from_millis(100)),
            ..config()
        },
    );

    let result = tokio::time::timeout(Duration::from_secs(3), coordinator.run(&specs(&root, 0..2)))
        .await
        .expect("batch did not finish")
        .unwrap();

    assert!(result.outcomes().all(|o| *o == Outcome::NotCompleted));
    assert_eq!(result.cancelled, Some(CancelReason::BatchTimeout));
}

#[tokio::test]
async fn test_fail_fast_cancels_siblings() {
    let root = scratch();
    let scheduler = MockScheduler::new()
        .with_default(Run::Hang)
        .script(0, [Submit::Accept(Run::Fail { exit_code: 1 })]);
    let (_, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            max_retries: 0,
            fail_fast: true,
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, 0..3)).await.unwrap();

    assert_eq!(failure_kind(&result.entries[0].outcome), Some(FailureKind::Execution));
    assert_eq!(result.entries[1].outcome, Outcome::NotCompleted);
    assert_eq!(result.entries[2].outcome, Outcome::NotCompleted);
    assert_eq!(result.cancelled, Some(CancelReason::FailFast { ordinal: 0 }));
}

#[tokio::test]
async fn test_batch_timeout_cancels_remaining_jobs() {
    let root = scratch();
    let scheduler = MockScheduler::new()
        .with_default(Run::Hang)
        .script(0, [Submit::Accept(Run::Succeed { polls: 0 })]);
    let (_, coordinator) = coordinator(
        scheduler,
        LauncherConfig {
            batch_timeout: Some(Duration::from_millis(80)),
            ..config()
        },
    );

    let result = coordinator.run(&specs(&root, 0..2)).await.unwrap();

    assert!(result.entries[0].outcome.is_success());
    assert_eq!(result.entries[1].outcome, Outcome::NotCompleted);
    assert_eq!(result.cancelled, Some(CancelReason::BatchTimeout));
}

#[tokio::test]
async fn test_crashed_driver_leaves_no_live_job() {
    let root = scratch();
    let scheduler = MockScheduler::new().script(0, [Submit::Accept(Run::Crash)]);
    let (scheduler, coordinator) = coordinator(scheduler, config());

    let result = coordinator.run(&specs(&root, [0, 1])).await.unwrap();

    let ids = scheduler.ids_for(0);
    assert_eq!(ids.len(), 1);
    assert!(scheduler.cancelled().contains(&ids[0]));
    assert_eq!(result.entries[0].outcome, Outcome::NotCompleted);
    assert_eq!(result.entries[0].external_ids, ids);
    assert!(result.entries[1].outcome.is_success());
    assert_eq!(result.cancelled, None);
}

// ============================================================================
// Configuration errors
// ============================================================================

#[tokio::test]
async fn test_invalid_configuration_submits_nothing() {
    let root = scratch();
    let (scheduler, coordinator) = coordinator(
        MockScheduler::new(),
        LauncherConfig {
            command: Vec::new(),
            ..config()
        },
    );

    let err = coordinator.run(&specs(&root, 0..3)).await.unwrap_err();

    assert!(matches!(err, LaunchError::InvalidConfiguration(_)));
    assert_eq!(scheduler.total_submits(), 0);
}

#[tokio::test]
async fn test_duplicate_ordinals_are_rejected() {
    let root = scratch();
    let (scheduler, coordinator) = coordinator(MockScheduler::new(), config());

    let err = coordinator.run(&specs(&root, [0, 1, 0])).await.unwrap_err();

    assert!(matches!(err, LaunchError::InvalidConfiguration(_)));
    assert_eq!(scheduler.total_submits(), 0);
}

#[tokio::test]
async fn test_shared_output_directory_is_rejected() {
    let root = scratch();
    let (scheduler, coordinator) = coordinator(MockScheduler::new(), config());
    let specs = vec![
        RunSpec::new(0, root.join("shared")).with_param("seed", "0"),
        RunSpec::new(1, root.join("other").join("..").join("shared")).with_param("seed", "1"),
    ];
    std::fs::create_dir_all(root.join("other")).unwrap();

    let err = coordinator.run(&specs).await.unwrap_err();

    let message = match err {
        LaunchError::InvalidConfiguration(message) => message,
        other => panic!("expected a configuration error, got {other:?}"),
    };
    assert!(message.contains("Runs 0 and 1 share output directory"), "{message}");
    assert_eq!(scheduler.total_submits(), 0);

    let saved = std::fs::read_to_string(root.join("shared").join("params.json")).unwrap();
    let saved: RunSpec = serde_json::from_str(&saved).unwrap();
    assert_eq!(saved.ordinal, 0);
}

#[tokio::test]
async fn test_unknown_queue_is_rejected() {
    let root = scratch();
    let mut config = config();
    config.known_queues = vec!["gpu".into(), "cpu".into()];
    config.resources.queue = Some("debug".into());
    let (scheduler, coordinator) = coordinator(MockScheduler::new(), config);

    let err = coordinator.run(&specs(&root, [0])).await.unwrap_err();

    assert!(matches!(err, LaunchError::InvalidConfiguration(_)));
    assert_eq!(scheduler.total_submits(), 0);
}

#[tokio::test]
async fn test_unavailable_scheduler() {
    let root = scratch();
    let (scheduler, coordinator) = coordinator(MockScheduler::new().unavailable(), config());

    let err = coordinator.run(&specs(&root, [0])).await.unwrap_err();

    assert!(matches!(err, LaunchError::SchedulerUnavailable(_)));
    assert_eq!(scheduler.total_submits(), 0);
}

// ============================================================================
// Dry run
// ============================================================================

#[tokio::test]
async fn test_dry_run_renders_without_submitting() {
    let root = scratch();
    let (scheduler, coordinator) = coordinator(MockScheduler::new(), config());

    let scripts = coordinator.dry_run(&specs(&root, [0, 1])).await.unwrap();

    assert_eq!(scripts.len(), 2);
    assert_eq!(scripts[0].0, "train_0");
    assert!(scripts[1].1.starts_with("#!/bin/bash"));
    assert!(scripts[1].1.contains("seed=1"));
    assert_eq!(scheduler.total_submits(), 0);
}
