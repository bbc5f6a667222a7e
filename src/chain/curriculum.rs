//! Stage 1: curriculum scheme from an assessment result.

use crate::artifact::{validate_curriculum, CurriculumScheme, LessonDescriptor};
use crate::assessment::AssessmentResult;
use crate::chain::parse::parse_json;
use crate::chain::prompt::{bullet_list, fill, system_message};
use crate::chain::{Stage, StageChain};
use crate::guideline::GuidelineSnapshot;
use crate::provider::ChatMessage;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

const ROLE: &str = "You are an expert curriculum designer building personalised learning paths.";

const REQUEST: &str = "Design a curriculum for the subject \"{subject}\" for a {level} learner.

The curriculum must contain exactly {count} lessons with ids 1 to {count} in teaching order.

Topics the learner already knows (do not teach these; replace them with more advanced material):
{known}

Topics the learner struggled with (reinforce these):
{weak}

Respond with a JSON object of this shape:
{\"lessons\": [{\"id\": 1, \"title\": \"...\", \"topics\": [\"...\"], \"prerequisites\": [], \"difficulty\": \"beginner|intermediate|advanced\", \"estimated_minutes\": 45}]}
Prerequisites may only reference lessons with a lower id.";

#[derive(Deserialize)]
#[serde(untagged)]
enum CurriculumReply {
    Wrapped { lessons: Vec<LessonDescriptor> },
    Bare(Vec<LessonDescriptor>),
}

/// Produces a scheme of exactly `lesson_count` lessons.
#[derive(Debug, Clone)]
pub struct CurriculumChain {
    lesson_count: usize,
}

impl CurriculumChain {
    pub fn new(lesson_count: usize) -> Self {
        Self { lesson_count }
    }
}

impl StageChain for CurriculumChain {
    type Input = AssessmentResult;
    type Output = CurriculumScheme;

    const STAGE: Stage = Stage::Curriculum;

    fn render(
        &self,
        input: &AssessmentResult,
        guidelines: &[Arc<GuidelineSnapshot>],
    ) -> Vec<ChatMessage> {
        let count = self.lesson_count.to_string();
        let request = fill(
            REQUEST,
            &[
                ("subject", input.subject.as_str()),
                ("level", input.skill_level.as_str()),
                ("count", count.as_str()),
                ("known", bullet_list(&input.known_topics).as_str()),
                ("weak", bullet_list(&input.weak_topics).as_str()),
            ],
        );
        vec![system_message(ROLE, guidelines), ChatMessage::user(request)]
    }

    fn parse(&self, raw: &str, input: &AssessmentResult) -> Result<CurriculumScheme, String> {
        let mut lessons = match parse_json::<CurriculumReply>(raw)? {
            CurriculumReply::Wrapped { lessons } | CurriculumReply::Bare(lessons) => lessons,
        };
        lessons.sort_by_key(|lesson| lesson.id);

        let scheme = CurriculumScheme {
            subject: input.subject.clone(),
            skill_level: input.skill_level,
            lessons,
            generated_at: Utc::now(),
        };
        validate_curriculum(&scheme, self.lesson_count, input)?;
        Ok(scheme)
    }
}
