use lessonforge::config::{ConfigLoader, ProviderType};
use lessonforge::error::{FailureKind, PipelineError};
use lessonforge::orchestrator::PipelineOrchestrator;
use lessonforge::progress::RunStatus;
use tempfile::TempDir;

use crate::integration::test_utils::*;

#[test]
fn every_section_is_read_from_a_config_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("lessonforge.toml");
    std::fs::write(
        &path,
        r#"
[provider]
provider_type = "anthropic"
model = "claude-test"
endpoint = "https://example.invalid"

[provider.default_options]
temperature = 0.3

[retry]
max_retries = 4
base_delay_ms = 10
max_delay_ms = 100
jitter_ms = 0

[executor]
max_concurrent_runs = 3

[pipeline]
lesson_count = 6
lesson_concurrency = 2
min_content_chars = 150

[storage]
data_dir = "/var/lib/lessonforge"
guidelines_dir = "/etc/lessonforge/guidelines"

[logging]
level = "debug"
format = "json"
output = "stderr"

[logging.modules]
"lessonforge::chain" = "trace"
"#,
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&path).unwrap();
    assert_eq!(config.provider.provider_type, ProviderType::Anthropic);
    assert_eq!(config.provider.model, "claude-test");
    assert_eq!(config.provider.default_options.temperature, Some(0.3));
    assert_eq!(config.retry.max_retries, 4);
    assert_eq!(config.retry.max_delay_ms, 100);
    assert_eq!(config.executor.max_concurrent_runs, 3);
    assert_eq!(config.executor.max_queued_runs, 1000);
    assert_eq!(config.pipeline.lesson_count, 6);
    assert_eq!(config.pipeline.lesson_concurrency, 2);
    assert_eq!(config.pipeline.min_content_chars, 150);
    assert_eq!(
        config.storage.guidelines_dir.as_deref(),
        Some(std::path::Path::new("/etc/lessonforge/guidelines"))
    );
    assert_eq!(config.logging.format, "json");
    assert_eq!(config.logging.modules["lessonforge::chain"], "trace");
}

#[test]
fn unknown_provider_type_is_a_config_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[provider]\nprovider_type = \"carrier-pigeon\"\nmodel = \"m\"\n").unwrap();

    assert!(matches!(
        ConfigLoader::load_from_file(&path),
        Err(PipelineError::Config(_))
    ));
}

#[test]
fn inconsistent_retry_bounds_are_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("bad.toml");
    std::fs::write(&path, "[retry]\nbase_delay_ms = 500\nmax_delay_ms = 100\n").unwrap();

    match ConfigLoader::load_from_file(&path) {
        Err(PipelineError::Config(message)) => assert!(message.contains("Retry:")),
        other => panic!("expected validation failure, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn orchestrator_is_wired_from_a_config_file() {
    let data_dir = TempDir::new().unwrap();
    let guidelines_dir = TempDir::new().unwrap();
    for kind in ["general", "curriculum", "lesson_plan", "content"] {
        std::fs::write(guidelines_dir.path().join(format!("{kind}.md")), "Be precise.").unwrap();
    }
    let path = data_dir.path().join("lessonforge.toml");
    std::fs::write(
        &path,
        format!(
            r#"
[provider]
provider_type = "ollama"
model = "llama3"
endpoint = "http://127.0.0.1:9"

[retry]
max_retries = 2
base_delay_ms = 0
max_delay_ms = 0
jitter_ms = 0

[storage]
data_dir = {:?}
guidelines_dir = {:?}
"#,
            data_dir.path().join("db").display().to_string(),
            guidelines_dir.path().display().to_string(),
        ),
    )
    .unwrap();

    let config = ConfigLoader::load_from_file(&path).unwrap();
    let orch = PipelineOrchestrator::from_config(&config).unwrap();
    assert_eq!(orch.settings().lesson_count, 10);

    let run_id = orch.start(USER, SUBJECT, assessment()).unwrap();
    let run = wait_terminal(&orch, &run_id).await;
    assert_status(&run, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, FailureKind::TransientServiceError);
    assert_eq!(error.attempts, Some(2));
    assert!(!orch.events(&run_id).unwrap().is_empty());
    orch.shutdown().await;
}
