//! Guideline documents
//!
//! Versioned text documents that parameterize prompt construction. A document
//! is addressed by its kind and an optional subject scope; the store keeps the
//! full version history per address and serves read-only snapshots of the
//! current version to the chains.

pub mod store;
pub mod version;

pub use store::{GuidelineSnapshot, GuidelineStore};
pub use version::{GuidelineDiff, GuidelineVersion, VersionBump, VersionNumber};

use crate::chain::Stage;
use crate::error::GuidelineError;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuidelineKind {
    /// Quality and tone rules shared by every stage
    General,
    Curriculum,
    LessonPlan,
    Content,
}

impl GuidelineKind {
    pub const ALL: [GuidelineKind; 4] = [
        GuidelineKind::General,
        GuidelineKind::Curriculum,
        GuidelineKind::LessonPlan,
        GuidelineKind::Content,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GuidelineKind::General => "general",
            GuidelineKind::Curriculum => "curriculum",
            GuidelineKind::LessonPlan => "lesson_plan",
            GuidelineKind::Content => "content",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == value)
    }

    /// Kinds consulted by a stage, in prompt order.
    pub fn for_stage(stage: Stage) -> [GuidelineKind; 2] {
        let specific = match stage {
            Stage::Curriculum => GuidelineKind::Curriculum,
            Stage::LessonPlan => GuidelineKind::LessonPlan,
            Stage::Content => GuidelineKind::Content,
        };
        [GuidelineKind::General, specific]
    }
}

impl fmt::Display for GuidelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of one guideline document
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GuidelineKey {
    pub kind: GuidelineKind,
    pub subject: Option<String>,
}

impl GuidelineKey {
    pub fn new(kind: GuidelineKind, subject: Option<&str>) -> Self {
        Self {
            kind,
            subject: subject
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty()),
        }
    }

    pub fn global(kind: GuidelineKind) -> Self {
        Self::new(kind, None)
    }

    /// Storage key: `kind` or `kind@subject`.
    pub fn storage_key(&self) -> String {
        match &self.subject {
            Some(subject) => format!("{}@{}", self.kind.as_str(), subject),
            None => self.kind.as_str().to_string(),
        }
    }

    pub fn parse(value: &str) -> Result<Self, GuidelineError> {
        let (kind, subject) = match value.split_once('@') {
            Some((kind, subject)) => (kind, Some(subject)),
            None => (value, None),
        };
        let kind = GuidelineKind::parse(kind)
            .ok_or_else(|| GuidelineError::NotFound(format!("unknown guideline kind '{}'", kind)))?;
        Ok(Self::new(kind, subject))
    }
}

impl fmt::Display for GuidelineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.storage_key())
    }
}
