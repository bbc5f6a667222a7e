//! Per-run state machine and progress accounting.
//!
//! The tracker is owned by the task executing the run and is the only writer
//! of that run's record. Every change is published as a whole snapshot on a
//! watch channel, so status readers never observe a half-applied update.

use crate::chain::Stage;
use crate::error::RunError;
use crate::progress::event::{
    LessonCompletedData, RunEvent, RunFinishedData, RunStartedData, StatusChangedData,
    LESSON_COMPLETED, RUN_FINISHED, RUN_STARTED, STATUS_CHANGED,
};
use crate::progress::store::RunStore;
use crate::types::{LessonId, RunId, RunKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub const CURRICULUM_DONE_PERCENT: f64 = 33.0;
pub const PLANS_DONE_PERCENT: f64 = 66.0;
pub const CONTENT_SHARE_PERCENT: f64 = 34.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Queued,
    RunningCurriculum,
    RunningLessonPlans,
    RunningContent,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Queued => "QUEUED",
            RunStatus::RunningCurriculum => "RUNNING_CURRICULUM",
            RunStatus::RunningLessonPlans => "RUNNING_LESSON_PLANS",
            RunStatus::RunningContent => "RUNNING_CONTENT",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Failed => "FAILED",
            RunStatus::Cancelled => "CANCELLED",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    pub fn stage(self) -> Option<Stage> {
        match self {
            RunStatus::RunningCurriculum => Some(Stage::Curriculum),
            RunStatus::RunningLessonPlans => Some(Stage::LessonPlan),
            RunStatus::RunningContent => Some(Stage::Content),
            _ => None,
        }
    }

    pub fn for_stage(stage: Stage) -> Self {
        match stage {
            Stage::Curriculum => RunStatus::RunningCurriculum,
            Stage::LessonPlan => RunStatus::RunningLessonPlans,
            Stage::Content => RunStatus::RunningContent,
        }
    }

    /// Stages advance strictly in order; any live state may fail or be cancelled.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            RunStatus::Failed | RunStatus::Cancelled => true,
            RunStatus::RunningCurriculum => self == RunStatus::Queued,
            RunStatus::RunningLessonPlans => self == RunStatus::RunningCurriculum,
            RunStatus::RunningContent => self == RunStatus::RunningLessonPlans,
            RunStatus::Completed => self == RunStatus::RunningContent,
            RunStatus::Queued => false,
        }
    }

    pub(crate) fn describe(self) -> &'static str {
        match self {
            RunStatus::Queued => "queued",
            RunStatus::RunningCurriculum => "generating the curriculum",
            RunStatus::RunningLessonPlans => "generating lesson plans",
            RunStatus::RunningContent => "generating lesson content",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Progress after `completed` of `total` lessons have content.
pub fn content_progress(completed: u32, total: u32) -> f64 {
    if total == 0 {
        return PLANS_DONE_PERCENT + CONTENT_SHARE_PERCENT;
    }
    let completed = completed.min(total) as f64;
    PLANS_DONE_PERCENT + CONTENT_SHARE_PERCENT * completed / total as f64
}

/// Record of one pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    pub user: String,
    pub subject: String,
    pub status: RunStatus,
    pub progress_percentage: f64,
    pub current_step: String,
    #[serde(default)]
    pub lessons_total: u32,
    #[serde(default)]
    pub lessons_completed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resumed: bool,
}

impl PipelineRun {
    pub fn queued(run_id: RunId, key: &RunKey) -> Self {
        Self {
            run_id,
            user: key.user.clone(),
            subject: key.subject.clone(),
            status: RunStatus::Queued,
            progress_percentage: 0.0,
            current_step: "Waiting for a free worker".to_string(),
            lessons_total: 0,
            lessons_completed: 0,
            error: None,
            started_at: Utc::now(),
            completed_at: None,
            resumed: false,
        }
    }

    pub fn key(&self) -> RunKey {
        RunKey::new(self.user.clone(), self.subject.clone())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn status_view(&self) -> StatusView {
        StatusView {
            run_id: self.run_id.clone(),
            status: self.status,
            current_stage: self.status.stage(),
            progress_percentage: self.progress_percentage,
            current_step: self.current_step.clone(),
            started_at: self.started_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// Status query payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub current_stage: Option<Stage>,
    pub progress_percentage: f64,
    pub current_step: String,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<RunError>,
}

pub struct ProgressTracker {
    run: PipelineRun,
    updates: watch::Sender<PipelineRun>,
    store: Option<Arc<RunStore>>,
    next_seq: u64,
}

impl ProgressTracker {
    pub fn new(run: PipelineRun, store: Option<Arc<RunStore>>) -> (Self, watch::Receiver<PipelineRun>) {
        let (updates, receiver) = watch::channel(run.clone());
        (
            Self {
                run,
                updates,
                store,
                next_seq: 1,
            },
            receiver,
        )
    }

    pub fn run(&self) -> &PipelineRun {
        &self.run
    }

    pub fn record_started(&mut self, resumed: bool) {
        self.run.resumed = resumed;
        let data = serde_json::to_value(RunStartedData {
            user: self.run.user.clone(),
            subject: self.run.subject.clone(),
            resumed,
        })
        .unwrap_or(Value::Null);
        self.publish(Some((RUN_STARTED, data)));
    }

    /// Move to the running state for `stage`.
    pub fn enter_stage(&mut self, stage: Stage, step: impl Into<String>) -> bool {
        self.transition(RunStatus::for_stage(stage), step.into())
    }

    pub fn set_step(&mut self, step: impl Into<String>) {
        if self.run.is_terminal() {
            return;
        }
        self.run.current_step = step.into();
        self.publish(None);
    }

    /// Raise progress to `percent`; lower values are ignored.
    pub fn advance(&mut self, percent: f64, step: impl Into<String>) {
        if self.run.is_terminal() {
            return;
        }
        self.bump(percent);
        self.run.current_step = step.into();
        self.publish(None);
    }

    pub fn set_lessons(&mut self, completed: u32, total: u32) {
        self.run.lessons_total = total;
        self.run.lessons_completed = completed.min(total);
        self.bump(content_progress(self.run.lessons_completed, total));
        self.publish(None);
    }

    pub fn lesson_completed(&mut self, lesson_id: LessonId, duration_ms: Option<u64>) {
        if self.run.is_terminal() {
            return;
        }
        let total = self.run.lessons_total;
        self.run.lessons_completed = (self.run.lessons_completed + 1).min(total);
        let completed = self.run.lessons_completed;
        self.bump(content_progress(completed, total));
        self.run.current_step = format!("Generated lesson {lesson_id} content ({completed}/{total})");
        let data = serde_json::to_value(LessonCompletedData {
            lesson_id,
            completed,
            total,
            duration_ms,
        })
        .unwrap_or(Value::Null);
        self.publish(Some((LESSON_COMPLETED, data)));
    }

    pub fn complete(&mut self) -> bool {
        if !self.transition(RunStatus::Completed, "Completed".to_string()) {
            return false;
        }
        self.finish(None);
        true
    }

    pub fn fail(&mut self, error: RunError) -> bool {
        if self.run.is_terminal() {
            warn!(run_id = %self.run.run_id, error = %error.message, "Ignoring failure of a finished run");
            return false;
        }
        let step = format!("Failed while {}", self.run.status.describe());
        let message = error.message.clone();
        self.run.error = Some(error);
        if !self.transition(RunStatus::Failed, step) {
            return false;
        }
        self.finish(Some(message));
        true
    }

    pub fn cancel(&mut self) -> bool {
        let step = format!("Cancelled while {}", self.run.status.describe());
        if !self.transition(RunStatus::Cancelled, step) {
            return false;
        }
        self.finish(None);
        true
    }

    fn transition(&mut self, next: RunStatus, step: String) -> bool {
        let from = self.run.status;
        if !from.can_transition_to(next) {
            warn!(
                run_id = %self.run.run_id,
                from = %from,
                to = %next,
                "Rejected illegal run status transition"
            );
            return false;
        }
        self.run.status = next;
        self.run.current_step = step;
        if next == RunStatus::Completed {
            self.bump(100.0);
        }
        if next.is_terminal() {
            self.run.completed_at = Some(Utc::now());
        }
        info!(
            run_id = %self.run.run_id,
            from = %from,
            to = %next,
            progress = self.run.progress_percentage,
            "Run status changed"
        );
        let data = serde_json::to_value(StatusChangedData {
            from: from.as_str().to_string(),
            to: next.as_str().to_string(),
            progress_percentage: self.run.progress_percentage,
        })
        .unwrap_or(Value::Null);
        self.publish(Some((STATUS_CHANGED, data)));
        true
    }

    fn finish(&mut self, error: Option<String>) {
        let data = serde_json::to_value(RunFinishedData {
            status: self.run.status.as_str().to_string(),
            error,
        })
        .unwrap_or(Value::Null);
        self.publish(Some((RUN_FINISHED, data)));
    }

    fn bump(&mut self, percent: f64) {
        let clamped = percent.clamp(0.0, 100.0);
        if clamped > self.run.progress_percentage {
            self.run.progress_percentage = clamped;
        }
    }

    /// Publish the snapshot to readers, then persist it best-effort.
    fn publish(&mut self, event: Option<(&str, Value)>) {
        self.updates.send_replace(self.run.clone());

        let Some(store) = &self.store else {
            return;
        };
        if let Err(err) = store.put_run(&self.run) {
            warn!(run_id = %self.run.run_id, error = %err, "failed to persist run snapshot");
        }
        if let Some((event_type, data)) = event {
            let seq = self.next_seq;
            self.next_seq += 1;
            let record = RunEvent::new(self.run.run_id.as_str(), seq, event_type, data);
            if let Err(err) = store.append_event(&record).and_then(|_| store.flush()) {
                warn!(
                    run_id = %self.run.run_id,
                    event_type = %event_type,
                    error = %err,
                    "failed to record run event"
                );
            } else {
                debug!(run_id = %self.run.run_id, seq, event_type = %event_type, "Recorded run event");
            }
        }
    }
}
