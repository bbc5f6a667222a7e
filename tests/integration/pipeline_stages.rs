use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use lessonforge::artifact::{ArtifactStore, MemoryArtifactStore};
use lessonforge::chain::RetryPolicy;
use lessonforge::error::{FailureKind, ProviderError};
use lessonforge::guideline::GuidelineKind;
use lessonforge::orchestrator::{PipelineOrchestrator, PipelineSettings};
use lessonforge::progress::RunStatus;
use lessonforge::provider::ScriptedReply;

use crate::integration::test_utils::*;

#[tokio::test]
async fn full_run_produces_ten_contiguous_lessons_with_matching_plans() {
    let provider = Arc::new(course_provider());
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(10));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Completed);
    assert_eq!(run.progress_percentage, 100.0);
    assert_eq!(run.lessons_total, 10);
    assert_eq!(run.lessons_completed, 10);
    assert!(run.completed_at.is_some());

    let curriculum = store.load_curriculum(&key()).unwrap().unwrap();
    assert_eq!(curriculum.lesson_ids(), (1..=10).collect::<Vec<_>>());

    let plans = store.load_lesson_plans(&key()).unwrap().unwrap();
    let plan_ids: BTreeSet<_> = plans.plans.iter().map(|p| p.lesson_id).collect();
    let lesson_ids: BTreeSet<_> = curriculum.lesson_ids().into_iter().collect();
    assert_eq!(plan_ids, lesson_ids);

    assert_eq!(store.saved_lessons(), (1..=10).collect::<Vec<_>>());
    let contents = store.list_lesson_content(&key()).unwrap();
    assert_eq!(contents.len(), 10);
    assert!(contents
        .iter()
        .all(|c| c.metadata.model == "scripted-model" && c.metadata.source_method == "content_chain"));

    // One call per stage request, one per lesson.
    assert_eq!(provider.call_count(), 12);
    orch.shutdown().await;
}

#[tokio::test]
async fn known_topic_is_rejected_and_regenerated_with_reinforced_prompt() {
    let tainted = curriculum_reply(10).replace("\"topic 3\"", "\"Variables\"");
    let provider = Arc::new(course_provider().route("Design a curriculum", [tainted]));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(10));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);

    assert_eq!(provider.calls_matching("could not be accepted"), 1);
    let reinforced = provider
        .calls()
        .into_iter()
        .find(|c| c.transcript().contains("could not be accepted"))
        .unwrap();
    assert!(reinforced
        .transcript()
        .contains("covers 'Variables', which the learner already knows"));

    let curriculum = store.load_curriculum(&key()).unwrap().unwrap();
    assert_eq!(curriculum.lessons.len(), 10);
    assert!(curriculum
        .lessons
        .iter()
        .all(|l| l.topics.iter().all(|t| !t.eq_ignore_ascii_case("variables"))));
    orch.shutdown().await;
}

#[tokio::test]
async fn second_invalid_output_fails_with_validation_error() {
    let provider = Arc::new(
        course_provider()
            .route("Design a curriculum", ["this is not json"])
            .route("could not be accepted", ["{\"lessons\": []}"]),
    );
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(10));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::ValidationError);
    assert!(error.message.contains("expected exactly 10 lessons"));
    assert_eq!(provider.call_count(), 2);
    assert!(store.load_curriculum(&key()).unwrap().is_none());
    orch.shutdown().await;
}

#[tokio::test]
async fn plan_set_missing_a_lesson_fails_the_stage() {
    let incomplete = plans_reply(&(1..=9).collect::<Vec<_>>());
    let provider = Arc::new(
        course_provider()
            .route("Write lesson plans", [incomplete.clone()])
            .route("could not be accepted", [incomplete]),
    );
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(10));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::ValidationError);
    assert!(error.message.contains("missing plans for lessons [10]"));
    // Curriculum progress is kept, nothing past it was produced.
    assert_eq!(run.progress_percentage, 33.0);
    assert!(store.load_curriculum(&key()).unwrap().is_some());
    assert!(store.load_lesson_plans(&key()).unwrap().is_none());
    assert_eq!(provider.calls_matching("Write the content for lesson #"), 0);
    orch.shutdown().await;
}

#[tokio::test]
async fn failing_lesson_keeps_earlier_lessons() {
    let provider = Arc::new(course_provider().route(
        "lesson #6:",
        [ScriptedReply::Fail(ProviderError::ClientError(
            "content policy rejection".to_string(),
        ))],
    ));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider.clone(), store.clone(), settings(10));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::ClientError);
    assert_eq!(error.lesson_id, Some(6));
    assert!(error.message.contains("content policy rejection"));

    assert_eq!(store.saved_lessons(), vec![1, 2, 3, 4, 5]);
    for id in 1..=5 {
        assert!(store.load_lesson_content(&key(), id).unwrap().is_some());
    }
    assert_eq!(provider.calls_matching("lesson #7:"), 0);
    orch.shutdown().await;
}

#[tokio::test]
async fn parallel_lessons_are_persisted_in_curriculum_order() {
    let provider = Arc::new(course_provider().with_latency(Duration::from_millis(5)));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(
        provider.clone(),
        store.clone(),
        PipelineSettings {
            lesson_concurrency: 3,
            ..settings(10)
        },
    );

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);

    assert_eq!(store.saved_lessons(), (1..=10).collect::<Vec<_>>());
    for content in store.list_lesson_content(&key()).unwrap() {
        assert!(content.body.starts_with(&format!("# Lesson {}\n", content.lesson_id)));
    }
    orch.shutdown().await;
}

#[tokio::test]
async fn stage_prompts_carry_global_and_subject_guidelines() {
    let guidelines = seeded_guidelines();
    guidelines
        .create_version(
            GuidelineKind::Content,
            Some("Python"),
            "Use snake_case in every example.",
            "python house style",
            "editor",
        )
        .unwrap();
    let provider = Arc::new(course_provider());
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let orch = PipelineOrchestrator::builder(provider.clone(), guidelines, artifacts)
        .retry_policy(RetryPolicy::immediate(3))
        .settings(settings(2))
        .build()
        .unwrap();

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);

    for call in provider.calls() {
        let transcript = call.transcript();
        assert!(transcript.contains("Follow the general rules."));
        let is_content = transcript.contains("Write the content for lesson #");
        assert_eq!(transcript.contains("Use snake_case in every example."), is_content);
        assert_eq!(transcript.contains("Follow the content rules."), is_content);
    }
    orch.shutdown().await;
}

#[tokio::test]
async fn missing_stage_guideline_fails_the_run() {
    let guidelines = Arc::new(lessonforge::guideline::GuidelineStore::temporary().unwrap());
    guidelines
        .create_version(GuidelineKind::General, None, "general", "seed", "test")
        .unwrap();
    let provider = Arc::new(course_provider());
    let artifacts: Arc<dyn ArtifactStore> = Arc::new(MemoryArtifactStore::new());
    let orch = PipelineOrchestrator::builder(provider.clone(), guidelines, artifacts)
        .retry_policy(RetryPolicy::immediate(3))
        .settings(settings(2))
        .build()
        .unwrap();

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;

    assert_status(&run, RunStatus::Failed);
    assert_eq!(run.error.unwrap().kind, FailureKind::GuidelineError);
    assert_eq!(provider.call_count(), 0);
    orch.shutdown().await;
}

#[tokio::test]
async fn status_names_the_lesson_being_generated() {
    let provider = Arc::new(course_provider().with_latency(Duration::from_millis(60)));
    let store = Arc::new(RecordingStore::new());
    let orch = build_orchestrator(provider, store, settings(3));

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let mut steps: Vec<String> = Vec::new();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let view = orch.status(&run_id).unwrap();
        if view.status == RunStatus::RunningContent && steps.last() != Some(&view.current_step) {
            steps.push(view.current_step.clone());
        }
        if view.status.is_terminal() || tokio::time::Instant::now() > deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);
    let order: Vec<usize> = (1..=3)
        .map(|id| {
            let generating = format!("Generating lesson {id} content ({id}/3)");
            steps.iter().position(|s| *s == generating).unwrap()
        })
        .collect();
    assert!(order.windows(2).all(|w| w[0] < w[1]), "{steps:?}");
    orch.shutdown().await;
}
