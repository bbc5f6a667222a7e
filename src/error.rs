//! Error types for the lessonforge generation pipeline.

use crate::chain::Stage;
use crate::types::{LessonId, RunId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Invalid key: {0}")]
    InvalidKey(String),

    #[error("Storage I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl StorageError {
    pub(crate) fn backend(err: impl std::fmt::Display) -> Self {
        StorageError::IoError(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        ))
    }

    pub(crate) fn encoding(err: impl std::fmt::Display) -> Self {
        StorageError::IoError(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            err.to_string(),
        ))
    }
}

/// Outcome classes of a single generative-service invocation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Provider rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Provider server error: {0}")]
    ServerError(String),

    #[error("Provider request timed out: {0}")]
    Timeout(String),

    #[error("Provider rejected request: {0}")]
    ClientError(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),
}

impl ProviderError {
    /// Rate limits, timeouts and server-side failures are worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ProviderError::RateLimited(_) | ProviderError::ServerError(_) | ProviderError::Timeout(_)
        )
    }
}

/// Guideline store errors
#[derive(Debug, Error)]
pub enum GuidelineError {
    #[error("Guideline document not found: {0}")]
    NotFound(String),

    #[error("Guideline version {version} not found for {key}")]
    VersionNotFound { key: String, version: String },

    #[error("Cannot delete version {version} of {key}: it is the current version")]
    DeleteCurrentVersion { key: String, version: String },

    #[error("Invalid guideline version: {0}")]
    InvalidVersion(String),

    #[error("Guideline storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors raised while running one generation stage
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("{stage} stage failed after {attempts} attempts: {source}")]
    Transient {
        stage: Stage,
        attempts: u32,
        #[source]
        source: ProviderError,
    },

    #[error("{stage} stage produced invalid output: {message}")]
    Validation { stage: Stage, message: String },

    #[error("{stage} stage request rejected: {source}")]
    Client {
        stage: Stage,
        #[source]
        source: ProviderError,
    },

    #[error("Fatal configuration error: {0}")]
    FatalConfiguration(String),

    #[error("Guideline error: {0}")]
    Guideline(#[from] GuidelineError),
}

impl ChainError {
    pub fn attempts(&self) -> Option<u32> {
        match self {
            ChainError::Transient { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}

/// Orchestrator-level errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Run {existing} is already active for user '{user}' and subject '{subject}'")]
    DuplicateRun {
        user: String,
        subject: String,
        existing: RunId,
    },

    #[error("Assessment is for subject '{assessed}', not '{subject}'")]
    SubjectMismatch { subject: String, assessed: String },

    #[error("Run not found: {0}")]
    RunNotFound(RunId),

    #[error("Run {0} has already finished")]
    RunTerminal(RunId),

    #[error("Executor is not accepting runs: {0}")]
    ExecutorStopped(String),

    #[error("Run queue is full ({0} runs waiting)")]
    QueueFull(usize),

    #[error("Chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("Guideline error: {0}")]
    Guideline(#[from] GuidelineError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}

/// Failure class recorded on a failed run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    TransientServiceError,
    ValidationError,
    FatalConfigurationError,
    ClientError,
    GuidelineError,
    StorageError,
    /// The process stopped while the run was active.
    Interrupted,
}

/// Cause of a failed run, as exposed to status queries
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    pub kind: FailureKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lesson_id: Option<LessonId>,
}

impl RunError {
    pub fn from_pipeline(err: &PipelineError, lesson_id: Option<LessonId>) -> Self {
        let (kind, attempts) = match err {
            PipelineError::Chain(chain) => (chain_failure_kind(chain), chain.attempts()),
            PipelineError::Guideline(_) => (FailureKind::GuidelineError, None),
            PipelineError::Storage(_) => (FailureKind::StorageError, None),
            PipelineError::Config(_) => (FailureKind::FatalConfigurationError, None),
            PipelineError::DuplicateRun { .. }
            | PipelineError::SubjectMismatch { .. }
            | PipelineError::RunNotFound(_)
            | PipelineError::RunTerminal(_)
            | PipelineError::ExecutorStopped(_)
            | PipelineError::QueueFull(_) => (FailureKind::FatalConfigurationError, None),
        };
        let message = match err {
            PipelineError::Chain(chain) => chain.to_string(),
            other => other.to_string(),
        };
        Self {
            kind,
            message,
            attempts,
            lesson_id,
        }
    }
}

fn chain_failure_kind(err: &ChainError) -> FailureKind {
    match err {
        ChainError::Transient { .. } => FailureKind::TransientServiceError,
        ChainError::Validation { .. } => FailureKind::ValidationError,
        ChainError::Client { .. } => FailureKind::ClientError,
        ChainError::FatalConfiguration(_) => FailureKind::FatalConfigurationError,
        ChainError::Guideline(_) => FailureKind::GuidelineError,
    }
}
