//! Stage 2: one lesson plan per curriculum lesson, in a single call.

use crate::artifact::{validate_lesson_plans, CurriculumScheme, LessonPlan, LessonPlanSet};
use crate::chain::parse::parse_json;
use crate::chain::prompt::{fill, system_message};
use crate::chain::{Stage, StageChain};
use crate::guideline::GuidelineSnapshot;
use crate::provider::ChatMessage;
use chrono::Utc;
use serde::Deserialize;
use std::sync::Arc;

const ROLE: &str = "You are an experienced instructor writing detailed lesson plans.";

const REQUEST: &str = "Write lesson plans for every lesson of this {level} curriculum on \"{subject}\".

Curriculum:
{lessons}

Return exactly one plan per lesson id ({ids}) as a JSON object of this shape:
{\"plans\": [{\"lesson_id\": 1, \"objectives\": [\"...\"], \"structure\": [{\"title\": \"...\", \"minutes\": 10}], \"activities\": [\"...\"], \"assessment\": \"...\"}]}";

#[derive(Deserialize)]
#[serde(untagged)]
enum PlanReply {
    Wrapped { plans: Vec<LessonPlan> },
    Bare(Vec<LessonPlan>),
}

#[derive(Debug, Clone, Default)]
pub struct LessonPlanChain;

impl LessonPlanChain {
    pub fn new() -> Self {
        Self
    }
}

fn describe_lessons(curriculum: &CurriculumScheme) -> String {
    curriculum
        .lessons
        .iter()
        .map(|lesson| {
            format!(
                "{}. {} [{}; {} min] topics: {}",
                lesson.id,
                lesson.title,
                lesson.difficulty.as_str(),
                lesson.estimated_minutes,
                lesson.topics.join(", ")
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl StageChain for LessonPlanChain {
    type Input = CurriculumScheme;
    type Output = LessonPlanSet;

    const STAGE: Stage = Stage::LessonPlan;

    fn render(
        &self,
        input: &CurriculumScheme,
        guidelines: &[Arc<GuidelineSnapshot>],
    ) -> Vec<ChatMessage> {
        let ids = input
            .lesson_ids()
            .iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let request = fill(
            REQUEST,
            &[
                ("level", input.skill_level.as_str()),
                ("subject", input.subject.as_str()),
                ("lessons", describe_lessons(input).as_str()),
                ("ids", ids.as_str()),
            ],
        );
        vec![system_message(ROLE, guidelines), ChatMessage::user(request)]
    }

    fn parse(&self, raw: &str, input: &CurriculumScheme) -> Result<LessonPlanSet, String> {
        let mut plans = match parse_json::<PlanReply>(raw)? {
            PlanReply::Wrapped { plans } | PlanReply::Bare(plans) => plans,
        };
        plans.sort_by_key(|plan| plan.lesson_id);
        let set = LessonPlanSet {
            plans,
            generated_at: Utc::now(),
            curriculum_digest: input.digest(),
        };
        validate_lesson_plans(&set, input)?;
        Ok(set)
    }
}
