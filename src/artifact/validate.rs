//! Structural checks applied to every stage result before it is accepted.
//!
//! Each check returns a human-readable reason; the chain layer feeds that
//! reason back to the model when it retries with a reinforced prompt.

use crate::artifact::types::{CurriculumScheme, LessonContent, LessonPlanSet};
use crate::assessment::AssessmentResult;
use crate::types::LessonId;
use std::collections::BTreeSet;

/// Lesson ids must be exactly `1..=expected`, prerequisites must point
/// backwards, and no lesson may teach a topic the learner already knows.
pub fn validate_curriculum(
    scheme: &CurriculumScheme,
    expected_lessons: usize,
    assessment: &AssessmentResult,
) -> Result<(), String> {
    if scheme.lessons.len() != expected_lessons {
        return Err(format!(
            "expected exactly {} lessons, got {}",
            expected_lessons,
            scheme.lessons.len()
        ));
    }

    for (index, lesson) in scheme.lessons.iter().enumerate() {
        let expected_id = (index + 1) as LessonId;
        if lesson.id != expected_id {
            return Err(format!(
                "lesson ids must be the contiguous sequence 1..{}; position {} has id {}",
                expected_lessons,
                index + 1,
                lesson.id
            ));
        }
        if lesson.title.trim().is_empty() {
            return Err(format!("lesson {} has an empty title", lesson.id));
        }
        if lesson.topics.iter().all(|t| t.trim().is_empty()) {
            return Err(format!("lesson {} lists no topics", lesson.id));
        }
        if let Some(bad) = lesson.prerequisites.iter().find(|p| **p >= lesson.id || **p == 0) {
            return Err(format!(
                "lesson {} lists prerequisite {}, prerequisites must reference earlier lessons",
                lesson.id, bad
            ));
        }
        if let Some(known) = lesson.topics.iter().find(|t| assessment.knows(t)) {
            return Err(format!(
                "lesson {} covers '{}', which the learner already knows; replace it with more advanced material",
                lesson.id, known
            ));
        }
        if lesson.estimated_minutes == 0 {
            return Err(format!("lesson {} has no estimated duration", lesson.id));
        }
    }

    Ok(())
}

/// The plan id set must equal the curriculum's lesson id set exactly.
pub fn validate_lesson_plans(
    plans: &LessonPlanSet,
    curriculum: &CurriculumScheme,
) -> Result<(), String> {
    let expected: BTreeSet<LessonId> = curriculum.lessons.iter().map(|l| l.id).collect();
    let mut seen = BTreeSet::new();
    for plan in &plans.plans {
        if !seen.insert(plan.lesson_id) {
            return Err(format!("lesson {} has more than one plan", plan.lesson_id));
        }
    }

    let missing: Vec<_> = expected.difference(&seen).copied().collect();
    if !missing.is_empty() {
        return Err(format!("missing plans for lessons {:?}", missing));
    }
    let extra: Vec<_> = seen.difference(&expected).copied().collect();
    if !extra.is_empty() {
        return Err(format!(
            "plans reference lessons {:?}, which are not in the curriculum",
            extra
        ));
    }

    for plan in &plans.plans {
        if plan.objectives.iter().all(|o| o.trim().is_empty()) {
            return Err(format!("plan for lesson {} has no objectives", plan.lesson_id));
        }
        if plan.structure.is_empty() || plan.total_minutes() == 0 {
            return Err(format!(
                "plan for lesson {} has no time-boxed structure",
                plan.lesson_id
            ));
        }
        if plan.assessment.trim().is_empty() {
            return Err(format!(
                "plan for lesson {} has no assessment description",
                plan.lesson_id
            ));
        }
    }

    Ok(())
}

pub fn validate_lesson_content(content: &LessonContent, min_chars: usize) -> Result<(), String> {
    let length = content.body.trim().chars().count();
    if length == 0 {
        return Err(format!("lesson {} content is empty", content.lesson_id));
    }
    if length < min_chars {
        return Err(format!(
            "lesson {} content is too short ({} characters, need at least {})",
            content.lesson_id, length, min_chars
        ));
    }
    Ok(())
}
