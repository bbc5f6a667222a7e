use std::sync::Arc;
use std::time::Duration;

use lessonforge::artifact::ArtifactStore;
use lessonforge::chain::RetryPolicy;
use lessonforge::error::PipelineError;
use lessonforge::executor::ExecutorConfig;
use lessonforge::orchestrator::PipelineOrchestrator;
use lessonforge::progress::{content_progress, RunStatus};
use lessonforge::types::{RunId, RunKey};

use crate::integration::test_utils::*;

#[tokio::test]
async fn cancel_mid_content_keeps_saved_lessons_and_starts_no_more() {
    let provider = Arc::new(course_provider());
    let store = Arc::new(RecordingStore::new());
    let orch = Arc::new(build_orchestrator(provider.clone(), store.clone(), settings(10)));
    store.cancel_after(4, &orch);

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Cancelled);
    assert!(run.error.is_none());
    assert!(run.completed_at.is_some());
    assert_eq!(run.lessons_completed, 4);
    assert_eq!(run.progress_percentage, content_progress(4, 10));

    assert_eq!(store.content_count(&key()), 4);
    assert_eq!(store.saved_lessons(), vec![1, 2, 3, 4]);
    assert_eq!(provider.calls_matching("Write the content for lesson #"), 4);
    assert!(orch.active_run(USER, SUBJECT).is_none());
    orch.shutdown().await;
}

#[tokio::test]
async fn cancelled_run_can_be_resumed_from_saved_lessons() {
    let provider = Arc::new(course_provider());
    let store = Arc::new(RecordingStore::new());
    let orch = Arc::new(build_orchestrator(provider.clone(), store.clone(), settings(10)));
    store.cancel_after(4, &orch);

    let first = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &first).await, RunStatus::Cancelled);

    let second = orch.resume(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &second).await;

    assert_status(&run, RunStatus::Completed);
    assert!(run.resumed);
    assert_eq!(run.lessons_completed, 10);
    assert_eq!(store.content_count(&key()), 10);
    assert_eq!(provider.calls_matching("Design a curriculum"), 1);
    assert_eq!(provider.calls_matching("Write lesson plans"), 1);
    assert_eq!(provider.calls_matching("Write the content for lesson #"), 10);
    orch.shutdown().await;
}

#[tokio::test]
async fn cancel_while_queued_never_calls_the_provider_for_that_run() {
    let provider = Arc::new(course_provider().with_latency(Duration::from_millis(20)));
    let store = Arc::new(RecordingStore::new());
    let artifacts: Arc<dyn ArtifactStore> = store.clone();
    let orch = PipelineOrchestrator::builder(provider.clone(), seeded_guidelines(), artifacts)
        .retry_policy(RetryPolicy::immediate(3))
        .settings(settings(3))
        .executor_config(ExecutorConfig {
            max_concurrent_runs: 1,
            max_queued_runs: 10,
        })
        .build()
        .unwrap();

    let busy = orch.start("grace", SUBJECT, assessment()).unwrap();
    let queued = orch.start(USER, SUBJECT, assessment()).unwrap();
    orch.cancel(&queued).unwrap();

    let run = wait_terminal(&orch, &queued).await;
    assert_status(&run, RunStatus::Cancelled);
    assert_eq!(run.progress_percentage, 0.0);
    assert!(run.current_step.contains("queued"));
    assert!(store.load_curriculum(&key()).unwrap().is_none());

    assert_status(&wait_terminal(&orch, &busy).await, RunStatus::Completed);
    assert_eq!(store.content_count(&RunKey::new("grace", SUBJECT)), 3);
    orch.shutdown().await;
}

#[tokio::test]
async fn cancel_is_idempotent_and_rejected_once_terminal() {
    let provider = Arc::new(course_provider().with_latency(Duration::from_millis(10)));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider, store, settings(5));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    orch.cancel(&run_id).unwrap();
    orch.cancel(&run_id).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Cancelled);

    assert!(matches!(
        orch.cancel(&run_id),
        Err(PipelineError::RunTerminal(id)) if id == run_id
    ));
    assert!(matches!(
        orch.cancel(&RunId::from("no-such-run")),
        Err(PipelineError::RunNotFound(_))
    ));
    orch.shutdown().await;
}

#[tokio::test]
async fn shutdown_cancels_active_runs_and_refuses_new_ones() {
    let provider = Arc::new(course_provider().with_latency(Duration::from_millis(20)));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider, store.clone(), settings(10));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    orch.shutdown().await;

    let run = orch.wait(&run_id).await.unwrap();
    assert_status(&run, RunStatus::Cancelled);
    assert!(store.content_count(&key()) < 10);

    assert!(matches!(
        orch.start(USER, SUBJECT, assessment()),
        Err(PipelineError::ExecutorStopped(_))
    ));
    assert!(orch.active_run(USER, SUBJECT).is_none());
}
