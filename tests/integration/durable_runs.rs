use std::sync::Arc;

use lessonforge::artifact::{ArtifactStore, SledArtifactStore};
use lessonforge::chain::RetryPolicy;
use lessonforge::config::{LessonforgeConfig, ProviderType};
use lessonforge::error::{FailureKind, PipelineError};
use lessonforge::guideline::GuidelineStore;
use lessonforge::orchestrator::PipelineOrchestrator;
use lessonforge::progress::{PipelineRun, RunStatus, RunStore};
use lessonforge::types::RunId;
use tempfile::TempDir;

use crate::integration::test_utils::*;

fn seed_guidelines_dir(dir: &std::path::Path) {
    for kind in ["general", "curriculum", "lesson_plan", "content"] {
        std::fs::write(dir.join(format!("{kind}.md")), format!("Follow the {kind} rules.")).unwrap();
    }
}

#[tokio::test]
async fn run_records_and_events_are_persisted() {
    let db = sled::Config::new().temporary(true).open().unwrap();
    let guidelines = Arc::new(GuidelineStore::new(&db).unwrap());
    for kind in lessonforge::guideline::GuidelineKind::ALL {
        guidelines
            .create_version(kind, None, format!("{} rules", kind.as_str()), "seed", "test")
            .unwrap();
    }
    let artifacts = Arc::new(SledArtifactStore::new(db.clone()).unwrap());
    let run_store = RunStore::shared(db.clone()).unwrap();
    let provider = Arc::new(course_provider());

    let orch = PipelineOrchestrator::builder(
        provider.clone(),
        Arc::clone(&guidelines),
        artifacts.clone() as Arc<dyn ArtifactStore>,
    )
    .retry_policy(RetryPolicy::immediate(3))
    .settings(settings(3))
    .run_store(Arc::clone(&run_store))
    .build()
    .unwrap();

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    assert_status(&wait_terminal(&orch, &run_id).await, RunStatus::Completed);

    let stored = run_store.get_run(&run_id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Completed);
    assert_eq!(stored.progress_percentage, 100.0);
    assert_eq!(artifacts.list_lesson_content(&key()).unwrap().len(), 3);

    let events = orch.events(&run_id).unwrap();
    let types: Vec<&str> = events.iter().map(|e| e.event_type.as_str()).collect();
    assert_eq!(
        types,
        [
            "run_started",
            "status_changed",
            "status_changed",
            "status_changed",
            "lesson_completed",
            "lesson_completed",
            "lesson_completed",
            "status_changed",
            "run_finished",
        ]
    );
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    assert_eq!(seqs, (1..=9).collect::<Vec<u64>>());
    assert_eq!(events[8].data["status"], "COMPLETED");
    orch.shutdown().await;

    // A second orchestrator over the same store answers from the records.
    let later = PipelineOrchestrator::builder(
        provider,
        guidelines,
        artifacts as Arc<dyn ArtifactStore>,
    )
    .settings(settings(3))
    .run_store(run_store)
    .build()
    .unwrap();
    let view = later.status(&run_id).unwrap();
    assert_eq!(view.status, RunStatus::Completed);
    assert_eq!(later.list_runs(USER).len(), 1);
    assert!(matches!(
        later.cancel(&run_id),
        Err(PipelineError::RunTerminal(_))
    ));
    assert!(later.status(&RunId::from("unknown")).is_none());
    later.shutdown().await;
}

#[tokio::test]
async fn startup_fails_runs_left_active_by_a_previous_process() {
    let data_dir = TempDir::new().unwrap();
    let guidelines_dir = TempDir::new().unwrap();
    seed_guidelines_dir(guidelines_dir.path());

    let stale_id = RunId::generate();
    {
        let store = RunStore::open(data_dir.path()).unwrap();
        let mut run = PipelineRun::queued(stale_id.clone(), &key());
        run.status = RunStatus::RunningContent;
        run.progress_percentage = 72.8;
        store.put_run(&run).unwrap();
        store.flush().unwrap();
    }

    let mut config = LessonforgeConfig::default();
    config.provider.provider_type = ProviderType::Ollama;
    config.provider.model = "llama3".to_string();
    config.provider.endpoint = Some("http://127.0.0.1:9".to_string());
    config.retry = RetryPolicy::immediate(3);
    config.pipeline = settings(3);
    config.storage.data_dir = data_dir.path().to_path_buf();
    config.storage.guidelines_dir = Some(guidelines_dir.path().to_path_buf());

    let orch = PipelineOrchestrator::from_config(&config).unwrap();

    let view = orch.status(&stale_id).unwrap();
    assert_eq!(view.status, RunStatus::Failed);
    assert_eq!(view.progress_percentage, 72.8);
    let error = view.error.unwrap();
    assert_eq!(error.kind, FailureKind::Interrupted);
    assert!(view.completed_at.is_some());

    // The stale record does not block a new run for the same key.
    assert!(orch.active_run(USER, SUBJECT).is_none());
    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;
    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::TransientServiceError);
    assert_eq!(error.attempts, Some(3));

    let runs = orch.list_runs(USER);
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].run_id, run_id);
    orch.shutdown().await;
}
