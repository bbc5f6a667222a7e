//! Assessment result consumed by the pipeline.
//!
//! Scoring happens upstream; the pipeline only needs the learner's level and
//! which topics to skip or reinforce.

use serde::{Deserialize, Serialize};

/// Learner skill level, also used as lesson difficulty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SkillLevel {
    #[serde(alias = "Beginner", alias = "BEGINNER")]
    Beginner,
    #[serde(alias = "Intermediate", alias = "INTERMEDIATE")]
    Intermediate,
    #[serde(alias = "Advanced", alias = "ADVANCED")]
    Advanced,
}

impl SkillLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            SkillLevel::Beginner => "beginner",
            SkillLevel::Intermediate => "intermediate",
            SkillLevel::Advanced => "advanced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub subject: String,
    pub skill_level: SkillLevel,
    /// Overall score in percent, if the survey produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    /// Topics the learner already knows; the curriculum must skip them.
    #[serde(default)]
    pub known_topics: Vec<String>,
    /// Topics the learner struggled with.
    #[serde(default)]
    pub weak_topics: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

impl AssessmentResult {
    pub fn new(subject: impl Into<String>, skill_level: SkillLevel) -> Self {
        Self {
            subject: subject.into(),
            skill_level,
            score: None,
            known_topics: Vec::new(),
            weak_topics: Vec::new(),
            notes: None,
        }
    }

    pub fn with_known_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.known_topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_weak_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.weak_topics = topics.into_iter().map(Into::into).collect();
        self
    }

    /// Normalized form used when matching topics against the known list.
    pub fn normalize_topic(topic: &str) -> String {
        topic.trim().to_lowercase()
    }

    pub fn knows(&self, topic: &str) -> bool {
        let needle = Self::normalize_topic(topic);
        self.known_topics
            .iter()
            .any(|known| Self::normalize_topic(known) == needle)
    }
}
