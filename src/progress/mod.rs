//! Run progress: state machine, durable run records and the run event log.

pub mod event;
pub mod store;
pub mod tracker;

pub use event::{now_millis, RunEvent};
pub use store::{PrunePolicy, RunStore};
pub use tracker::{content_progress, PipelineRun, ProgressTracker, RunStatus, StatusView};
