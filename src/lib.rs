//! Lessonforge: generative learning-content pipeline
//!
//! Turns a learner's assessment result into a personalised course in three
//! stages: a curriculum of lessons, a plan for every lesson, and the full
//! content of each lesson. Runs execute on a bounded worker pool, report
//! progress through a polled status record and persist every artifact as
//! soon as it is accepted.

pub mod artifact;
pub mod assessment;
pub mod chain;
pub mod config;
pub mod error;
pub mod executor;
pub mod guideline;
pub mod logging;
pub mod orchestrator;
pub mod progress;
pub mod provider;
pub mod types;

pub use orchestrator::{PipelineOrchestrator, PipelineSettings};
