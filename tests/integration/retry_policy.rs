use std::sync::Arc;
use std::time::{Duration, Instant};

use lessonforge::artifact::ArtifactStore;
use lessonforge::chain::RetryPolicy;
use lessonforge::error::{FailureKind, ProviderError};
use lessonforge::orchestrator::PipelineOrchestrator;
use lessonforge::progress::RunStatus;
use lessonforge::provider::ScriptedReply;

use crate::integration::test_utils::*;

fn fail(err: ProviderError) -> ScriptedReply {
    ScriptedReply::Fail(err)
}

#[tokio::test]
async fn transient_failures_are_retried_until_success() {
    let provider = Arc::new(course_provider().route(
        "Design a curriculum",
        [
            fail(ProviderError::ServerError("502 bad gateway".into())),
            fail(ProviderError::Timeout("no response".into())),
        ],
    ));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(3));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Completed);
    assert_eq!(provider.calls_matching("Design a curriculum"), 3);
    assert_eq!(store.content_count(&key()), 3);
    orch.shutdown().await;
}

#[tokio::test]
async fn exhausted_retries_fail_the_run_with_attempt_count() {
    let provider = Arc::new(course_provider().route(
        "Design a curriculum",
        (0..4).map(|_| fail(ProviderError::RateLimited("429 too many requests".into()))),
    ));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(3));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::TransientServiceError);
    assert_eq!(error.attempts, Some(3));
    assert!(error.message.contains("429 too many requests"));
    assert_eq!(error.lesson_id, None);

    assert_eq!(provider.calls_matching("Design a curriculum"), 3);
    assert_eq!(provider.calls_matching("Write lesson plans"), 0);
    assert!(store.load_curriculum(&key()).unwrap().is_none());
    orch.shutdown().await;
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let provider = Arc::new(course_provider().route(
        "Write lesson plans",
        [fail(ProviderError::ClientError("400 prompt too long".into()))],
    ));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(3));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::ClientError);
    assert!(error.message.contains("400 prompt too long"));
    assert_eq!(provider.calls_matching("Write lesson plans"), 1);
    orch.shutdown().await;
}

#[tokio::test]
async fn transient_lesson_failure_retries_only_that_lesson() {
    let provider = Arc::new(course_provider().route(
        "lesson #2:",
        [fail(ProviderError::ServerError("503".into()))],
    ));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(3));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);

    assert_eq!(provider.calls_matching("lesson #1:"), 1);
    assert_eq!(provider.calls_matching("lesson #2:"), 2);
    assert_eq!(provider.calls_matching("lesson #3:"), 1);
    assert_eq!(store.saved_lessons(), vec![1, 2, 3]);
    orch.shutdown().await;
}

#[tokio::test]
async fn retries_back_off_between_attempts() {
    let provider = Arc::new(course_provider().route(
        "Design a curriculum",
        [
            fail(ProviderError::ServerError("500".into())),
            fail(ProviderError::ServerError("500".into())),
        ],
    ));
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(RecordingStore::new());
    let orch = PipelineOrchestrator::builder(provider.clone(), seeded_guidelines(), artifacts)
        .retry_policy(RetryPolicy {
            max_retries: 3,
            base_delay_ms: 40,
            max_delay_ms: 1000,
            jitter_ms: 0,
        })
        .settings(settings(2))
        .build()
        .unwrap();

    let started = Instant::now();
    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);

    // 40ms before the second attempt, 80ms before the third.
    assert!(started.elapsed() >= Duration::from_millis(120));
    assert_eq!(provider.calls_matching("Design a curriculum"), 3);
    orch.shutdown().await;
}
