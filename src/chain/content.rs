//! Stage 3: the full document for one lesson.

use crate::artifact::{validate_lesson_content, LessonContent, LessonDescriptor, LessonPlan};
use crate::assessment::SkillLevel;
use crate::chain::parse::strip_fences;
use crate::chain::prompt::{bullet_list, fill, system_message};
use crate::chain::{Stage, StageChain};
use crate::guideline::GuidelineSnapshot;
use crate::provider::ChatMessage;
use std::sync::Arc;

pub const SOURCE_METHOD: &str = "content_chain";

const ROLE: &str = "You are a technical writer producing complete, self-contained lessons in markdown.";

const REQUEST: &str = "Write the content for lesson #{id}: {title}

Subject: {subject}
Learner level: {level}
Topics: {topics}

Objectives:
{objectives}

Lesson structure:
{structure}

Planned activities:
{activities}

End-of-lesson assessment: {assessment}

Respond with the lesson document in markdown only.";

/// Everything the content stage needs about one lesson
#[derive(Debug, Clone)]
pub struct ContentInput {
    pub subject: String,
    pub skill_level: SkillLevel,
    pub lesson: LessonDescriptor,
    pub plan: LessonPlan,
    pub curriculum_digest: String,
}

#[derive(Debug, Clone)]
pub struct ContentChain {
    min_chars: usize,
    model: String,
}

impl ContentChain {
    pub fn new(min_chars: usize, model: impl Into<String>) -> Self {
        Self {
            min_chars,
            model: model.into(),
        }
    }
}

impl StageChain for ContentChain {
    type Input = ContentInput;
    type Output = LessonContent;

    const STAGE: Stage = Stage::Content;

    fn render(&self, input: &ContentInput, guidelines: &[Arc<GuidelineSnapshot>]) -> Vec<ChatMessage> {
        let id = input.lesson.id.to_string();
        let structure = input
            .plan
            .structure
            .iter()
            .map(|segment| format!("- {} ({} min)", segment.title, segment.minutes))
            .collect::<Vec<_>>()
            .join("\n");
        let request = fill(
            REQUEST,
            &[
                ("id", id.as_str()),
                ("title", input.lesson.title.as_str()),
                ("subject", input.subject.as_str()),
                ("level", input.skill_level.as_str()),
                ("topics", input.lesson.topics.join(", ").as_str()),
                ("objectives", bullet_list(&input.plan.objectives).as_str()),
                ("structure", structure.as_str()),
                ("activities", bullet_list(&input.plan.activities).as_str()),
                ("assessment", input.plan.assessment.as_str()),
            ],
        );
        vec![system_message(ROLE, guidelines), ChatMessage::user(request)]
    }

    fn parse(&self, raw: &str, input: &ContentInput) -> Result<LessonContent, String> {
        let content = LessonContent::new(
            input.lesson.id,
            input.lesson.title.clone(),
            strip_fences(raw).to_string(),
            SOURCE_METHOD,
            self.model.clone(),
        )
        .for_curriculum(input.curriculum_digest.clone());
        validate_lesson_content(&content, self.min_chars)?;
        Ok(content)
    }
}
