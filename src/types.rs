//! Shared identifier types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Curriculum lesson identifier (1-based, contiguous within a curriculum).
pub type LessonId = u32;

static RUN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Identifier of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Generate a new process-unique run id.
    pub fn generate() -> Self {
        let ts = chrono::Utc::now().timestamp_millis();
        let pid = std::process::id();
        let seq = RUN_COUNTER.fetch_add(1, Ordering::Relaxed);
        RunId(format!("run-{ts}-{pid}-{seq}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        RunId(value.to_string())
    }
}

impl From<String> for RunId {
    fn from(value: String) -> Self {
        RunId(value)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of a run: at most one active run exists per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunKey {
    pub user: String,
    pub subject: String,
}

impl RunKey {
    pub fn new(user: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            subject: subject.into(),
        }
    }
}

impl fmt::Display for RunKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.user, self.subject)
    }
}
