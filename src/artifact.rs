//! Generated learning artifacts: the curriculum scheme, lesson plans and
//! per-lesson content, plus the persistence boundary they are handed to.

pub mod store;
pub mod types;
pub mod validate;

pub use store::{ArtifactStore, MemoryArtifactStore, SledArtifactStore};
pub use types::{
    ContentMetadata, CurriculumScheme, LessonContent, LessonDescriptor, LessonPlan,
    LessonPlanSet, PlanSegment,
};
pub use validate::{validate_curriculum, validate_lesson_content, validate_lesson_plans};
