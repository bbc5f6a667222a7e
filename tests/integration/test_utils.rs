//! Shared fixtures for integration tests
//!
//! A scripted provider that answers every stage prompt with valid output, a
//! seeded guideline store, and an artifact store that records save order and
//! can cancel a run from inside the pipeline.

use lessonforge::artifact::{
    ArtifactStore, CurriculumScheme, LessonContent, LessonPlanSet, MemoryArtifactStore,
};
use lessonforge::assessment::{AssessmentResult, SkillLevel};
use lessonforge::chain::RetryPolicy;
use lessonforge::error::StorageError;
use lessonforge::guideline::{GuidelineKind, GuidelineStore};
use lessonforge::orchestrator::{PipelineOrchestrator, PipelineSettings};
use lessonforge::progress::{PipelineRun, RunStatus};
use lessonforge::provider::{ChatMessage, MessageRole, ScriptedProvider, ScriptedReply};
use lessonforge::types::{LessonId, RunId, RunKey};
use serde_json::json;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

pub const USER: &str = "ada";
pub const SUBJECT: &str = "python";
pub const MIN_CONTENT_CHARS: usize = 100;

pub fn key() -> RunKey {
    RunKey::new(USER, SUBJECT)
}

pub fn assessment() -> AssessmentResult {
    AssessmentResult::new(SUBJECT, SkillLevel::Beginner)
        .with_known_topics(["variables"])
        .with_weak_topics(["loops"])
}

pub fn settings(lesson_count: usize) -> PipelineSettings {
    PipelineSettings {
        lesson_count,
        lesson_concurrency: 1,
        min_content_chars: MIN_CONTENT_CHARS,
    }
}

/// Store with one version of every global guideline document.
pub fn seeded_guidelines() -> Arc<GuidelineStore> {
    let store = GuidelineStore::temporary().unwrap();
    for kind in GuidelineKind::ALL {
        store
            .create_version(
                kind,
                None,
                format!("Follow the {} rules.", kind.as_str()),
                "initial",
                "test",
            )
            .unwrap();
    }
    Arc::new(store)
}

/// First user message: the stage request, also for reinforced retries.
pub fn request(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .find(|m| m.role == MessageRole::User)
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

pub fn curriculum_reply(count: u32) -> String {
    let lessons: Vec<_> = (1..=count)
        .map(|id| {
            let prerequisites: Vec<u32> = if id > 1 { vec![id - 1] } else { vec![] };
            json!({
                "id": id,
                "title": format!("Lesson {id}"),
                "topics": [format!("topic {id}")],
                "prerequisites": prerequisites,
                "difficulty": "beginner",
                "estimated_minutes": 45
            })
        })
        .collect();
    json!({ "lessons": lessons }).to_string()
}

pub fn plans_reply(ids: &[u32]) -> String {
    let plans: Vec<_> = ids
        .iter()
        .map(|id| {
            json!({
                "lesson_id": id,
                "objectives": [format!("master topic {id}")],
                "structure": [
                    {"title": "explanation", "minutes": 20},
                    {"title": "practice", "minutes": 25}
                ],
                "activities": ["pair exercise"],
                "assessment": "short quiz"
            })
        })
        .collect();
    json!({ "plans": plans }).to_string()
}

pub fn content_reply(id: u32) -> String {
    format!(
        "# Lesson {id}\n\n{}",
        "This paragraph explains the lesson topic with a worked example. ".repeat(4)
    )
}

fn requested_count(request: &str) -> u32 {
    request
        .split("exactly ")
        .nth(1)
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|n| n.parse().ok())
        .unwrap_or(10)
}

fn requested_plan_ids(request: &str) -> Vec<u32> {
    request
        .split("per lesson id (")
        .nth(1)
        .and_then(|rest| rest.split(')').next())
        .map(|ids| ids.split(',').filter_map(|id| id.trim().parse().ok()).collect())
        .unwrap_or_default()
}

fn requested_lesson(request: &str) -> u32 {
    request
        .split("lesson #")
        .nth(1)
        .and_then(|rest| rest.split(':').next())
        .and_then(|id| id.parse().ok())
        .unwrap_or(0)
}

/// Valid answer for whichever stage prompt `messages` carries.
pub fn course_responder(messages: &[ChatMessage]) -> ScriptedReply {
    let request = request(messages);
    if request.starts_with("Design a curriculum") {
        curriculum_reply(requested_count(request)).into()
    } else if request.starts_with("Write lesson plans") {
        plans_reply(&requested_plan_ids(request)).into()
    } else if request.starts_with("Write the content for lesson #") {
        content_reply(requested_lesson(request)).into()
    } else {
        ScriptedReply::Text(String::new())
    }
}

pub fn course_provider() -> ScriptedProvider {
    ScriptedProvider::new("scripted-model").with_fallback(course_responder)
}

pub fn build_orchestrator(
    provider: Arc<ScriptedProvider>,
    artifacts: Arc<dyn ArtifactStore>,
    settings: PipelineSettings,
) -> PipelineOrchestrator {
    PipelineOrchestrator::builder(provider, seeded_guidelines(), artifacts)
        .retry_policy(RetryPolicy::immediate(3))
        .settings(settings)
        .build()
        .unwrap()
}

/// Poll until the run is terminal.
pub async fn wait_terminal(orchestrator: &PipelineOrchestrator, run_id: &RunId) -> PipelineRun {
    tokio::time::timeout(Duration::from_secs(10), orchestrator.wait(run_id))
        .await
        .expect("run did not finish in time")
        .unwrap()
}

pub fn assert_status(run: &PipelineRun, status: RunStatus) {
    assert_eq!(run.status, status, "run ended as {:?}: {:?}", run.status, run.error);
}

/// Artifact store that records lesson save order and can cancel the active
/// run of [`key()`] once a given number of lessons is saved.
#[derive(Default)]
pub struct RecordingStore {
    inner: MemoryArtifactStore,
    saved: Mutex<Vec<LessonId>>,
    cancel_after: Mutex<Option<(usize, Weak<PipelineOrchestrator>)>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel_after(&self, lessons: usize, orchestrator: &Arc<PipelineOrchestrator>) {
        *self.cancel_after.lock().unwrap() = Some((lessons, Arc::downgrade(orchestrator)));
    }

    pub fn saved_lessons(&self) -> Vec<LessonId> {
        self.saved.lock().unwrap().clone()
    }

    pub fn content_count(&self, key: &RunKey) -> usize {
        self.inner.lesson_content_count(key)
    }
}

impl ArtifactStore for RecordingStore {
    fn save_curriculum(&self, key: &RunKey, scheme: &CurriculumScheme) -> Result<(), StorageError> {
        self.inner.save_curriculum(key, scheme)
    }

    fn load_curriculum(&self, key: &RunKey) -> Result<Option<CurriculumScheme>, StorageError> {
        self.inner.load_curriculum(key)
    }

    fn save_lesson_plans(&self, key: &RunKey, plans: &LessonPlanSet) -> Result<(), StorageError> {
        self.inner.save_lesson_plans(key, plans)
    }

    fn load_lesson_plans(&self, key: &RunKey) -> Result<Option<LessonPlanSet>, StorageError> {
        self.inner.load_lesson_plans(key)
    }

    fn save_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
        content: &LessonContent,
    ) -> Result<(), StorageError> {
        self.inner.save_lesson_content(key, lesson_id, content)?;
        let saved = {
            let mut saved = self.saved.lock().unwrap();
            saved.push(lesson_id);
            saved.len()
        };

        let hook = self
            .cancel_after
            .lock()
            .unwrap()
            .as_ref()
            .map(|(after, orch)| (*after, orch.clone()));
        if let Some((after, orch)) = hook {
            if saved == after {
                if let Some(orch) = orch.upgrade() {
                    if let Some(run_id) = orch.active_run(&key.user, &key.subject) {
                        orch.cancel(&run_id).unwrap();
                    }
                }
            }
        }
        Ok(())
    }

    fn load_lesson_content(
        &self,
        key: &RunKey,
        lesson_id: LessonId,
    ) -> Result<Option<LessonContent>, StorageError> {
        self.inner.load_lesson_content(key, lesson_id)
    }

    fn list_lesson_content(&self, key: &RunKey) -> Result<Vec<LessonContent>, StorageError> {
        self.inner.list_lesson_content(key)
    }

    fn clear_lesson_content(&self, key: &RunKey) -> Result<usize, StorageError> {
        self.inner.clear_lesson_content(key)
    }
}
