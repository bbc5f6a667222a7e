//! Run event schema.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

pub const RUN_STARTED: &str = "run_started";
pub const STATUS_CHANGED: &str = "status_changed";
pub const LESSON_COMPLETED: &str = "lesson_completed";
pub const RUN_FINISHED: &str = "run_finished";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub ts: String,
    pub run_id: String,
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: Value,
}

impl RunEvent {
    pub fn new(run_id: impl Into<String>, seq: u64, event_type: impl Into<String>, data: Value) -> Self {
        Self {
            ts: now_millis().to_string(),
            run_id: run_id.into(),
            seq,
            event_type: event_type.into(),
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStartedData {
    pub user: String,
    pub subject: String,
    pub resumed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusChangedData {
    pub from: String,
    pub to: String,
    pub progress_percentage: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LessonCompletedData {
    pub lesson_id: u32,
    pub completed: u32,
    pub total: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFinishedData {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
