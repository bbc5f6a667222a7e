//! Artifact records produced by the three stages.

use crate::assessment::SkillLevel;
use crate::types::LessonId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One curriculum entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonDescriptor {
    pub id: LessonId,
    pub title: String,
    pub topics: Vec<String>,
    #[serde(default, alias = "prerequisite_ids")]
    pub prerequisites: Vec<LessonId>,
    pub difficulty: SkillLevel,
    #[serde(alias = "estimated_duration", alias = "duration_minutes")]
    pub estimated_minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurriculumScheme {
    pub subject: String,
    pub skill_level: SkillLevel,
    pub lessons: Vec<LessonDescriptor>,
    pub generated_at: DateTime<Utc>,
}

impl CurriculumScheme {
    pub fn lesson_ids(&self) -> Vec<LessonId> {
        self.lessons.iter().map(|l| l.id).collect()
    }

    pub fn lesson(&self, id: LessonId) -> Option<&LessonDescriptor> {
        self.lessons.iter().find(|l| l.id == id)
    }

    /// blake3 digest of the encoded scheme, hex encoded. Plans and lesson
    /// content carry it to name the curriculum they were written for.
    pub fn digest(&self) -> String {
        let encoded = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(blake3::hash(&encoded).as_bytes())
    }
}

/// Time-boxed segment of a lesson
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSegment {
    pub title: String,
    pub minutes: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlan {
    pub lesson_id: LessonId,
    pub objectives: Vec<String>,
    pub structure: Vec<PlanSegment>,
    #[serde(default)]
    pub activities: Vec<String>,
    pub assessment: String,
}

impl LessonPlan {
    pub fn total_minutes(&self) -> u32 {
        self.structure.iter().map(|s| s.minutes).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonPlanSet {
    pub plans: Vec<LessonPlan>,
    pub generated_at: DateTime<Utc>,
    /// [`CurriculumScheme::digest`] of the curriculum these plans cover.
    #[serde(default)]
    pub curriculum_digest: String,
}

impl LessonPlanSet {
    pub fn plan(&self, lesson_id: LessonId) -> Option<&LessonPlan> {
        self.plans.iter().find(|p| p.lesson_id == lesson_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentMetadata {
    pub generated_at: DateTime<Utc>,
    pub source_method: String,
    pub model: String,
    /// blake3 digest of the body, hex encoded.
    pub content_digest: String,
    #[serde(default)]
    pub curriculum_digest: String,
}

/// Generated document for one lesson
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonContent {
    pub lesson_id: LessonId,
    pub title: String,
    pub body: String,
    pub metadata: ContentMetadata,
}

impl LessonContent {
    pub fn new(
        lesson_id: LessonId,
        title: impl Into<String>,
        body: String,
        source_method: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        let content_digest = hex::encode(blake3::hash(body.as_bytes()).as_bytes());
        Self {
            lesson_id,
            title: title.into(),
            body,
            metadata: ContentMetadata {
                generated_at: Utc::now(),
                source_method: source_method.into(),
                model: model.into(),
                content_digest,
                curriculum_digest: String::new(),
            },
        }
    }

    pub fn for_curriculum(mut self, curriculum_digest: impl Into<String>) -> Self {
        self.metadata.curriculum_digest = curriculum_digest.into();
        self
    }

    /// Whether this content was written for the curriculum with `digest`.
    pub fn belongs_to(&self, digest: &str) -> bool {
        self.metadata.curriculum_digest == digest
    }
}
