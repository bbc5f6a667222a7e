//! Configuration System
//!
//! Layered configuration for the pipeline: built-in defaults, the global
//! config file, workspace files and `LESSONFORGE__SECTION__KEY` environment
//! overrides, merged through the `config` crate and validated as a whole.

use crate::chain::RetryPolicy;
use crate::error::PipelineError;
use crate::executor::ExecutorConfig;
use crate::logging::LoggingConfig;
use crate::orchestrator::PipelineSettings;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub use crate::provider::{ProviderConfig, ProviderType};

mod merge;
pub mod paths;
mod sources;

pub use merge::merge_policy::{ENV_PREFIX, ENV_SEPARATOR};
pub use sources::workspace_file::ENV_NAME_VAR;

/// Root configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LessonforgeConfig {
    /// Generative service used by every stage
    #[serde(default)]
    pub provider: ProviderConfig,

    /// Backoff for transient service failures
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Worker pool bounds
    #[serde(default)]
    pub executor: ExecutorConfig,

    /// Per-run generation settings
    #[serde(default)]
    pub pipeline: PipelineSettings,

    /// Storage paths
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// On-disk locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Directory of the sled database holding guidelines, artifacts and runs
    #[serde(default = "paths::default_data_dir")]
    pub data_dir: PathBuf,

    /// Guideline documents imported at startup for keys with no history yet
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guidelines_dir: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: paths::default_data_dir(),
            guidelines_dir: None,
        }
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.data_dir.as_os_str().is_empty() {
            return Err("Data directory cannot be empty".to_string());
        }
        if let Some(dir) = &self.guidelines_dir {
            if dir.as_os_str().is_empty() {
                return Err("Guidelines directory cannot be empty when set".to_string());
            }
        }
        Ok(())
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    Provider(String),
    Retry(String),
    Executor(String),
    Pipeline(String),
    Storage(String),
    Logging(String),
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidationError::Provider(msg) => write!(f, "Provider: {}", msg),
            ValidationError::Retry(msg) => write!(f, "Retry: {}", msg),
            ValidationError::Executor(msg) => write!(f, "Executor: {}", msg),
            ValidationError::Pipeline(msg) => write!(f, "Pipeline: {}", msg),
            ValidationError::Storage(msg) => write!(f, "Storage: {}", msg),
            ValidationError::Logging(msg) => write!(f, "Logging: {}", msg),
        }
    }
}

impl std::error::Error for ValidationError {}

impl LessonforgeConfig {
    /// Validate the entire configuration, collecting every problem.
    pub fn validate(&self) -> Result<(), Vec<ValidationError>> {
        let mut errors = Vec::new();

        if let Err(e) = self.provider.validate() {
            errors.push(ValidationError::Provider(e));
        }
        if let Err(e) = self.retry.validate() {
            errors.push(ValidationError::Retry(e));
        }
        if let Err(e) = self.executor.validate() {
            errors.push(ValidationError::Executor(e));
        }
        if let Err(e) = self.pipeline.validate() {
            errors.push(ValidationError::Pipeline(e));
        }
        if let Err(e) = self.storage.validate() {
            errors.push(ValidationError::Storage(e));
        }
        if let Err(e) = self.logging.validate() {
            errors.push(ValidationError::Logging(e));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Loads [`LessonforgeConfig`] from every configured source.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Defaults, global file, `config/config.toml`, `config/{LESSONFORGE_ENV}.toml`,
    /// then environment overrides; the merged result must validate.
    pub fn load(workspace_root: &Path) -> Result<LessonforgeConfig, PipelineError> {
        let builder = merge::merge_policy::builder_with_defaults()?;
        let builder = sources::global_file::add_to_builder(builder)?;
        let builder = sources::workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = merge::merge_policy::add_environment(builder);

        let config: LessonforgeConfig = builder.build()?.try_deserialize()?;
        Self::validated(config)
    }

    /// Load a single explicit file on top of the defaults.
    pub fn load_from_file(path: &Path) -> Result<LessonforgeConfig, PipelineError> {
        if !path.exists() {
            return Err(PipelineError::Config(format!(
                "Configuration file not found: {}",
                path.display()
            )));
        }
        let config: LessonforgeConfig = merge::merge_policy::builder_with_defaults()?
            .add_source(config::File::from(path))
            .build()?
            .try_deserialize()?;
        Self::validated(config)
    }

    /// Location of the global config file, if a home directory is known.
    pub fn xdg_config_path() -> Option<PathBuf> {
        paths::global_config_path()
    }

    fn validated(config: LessonforgeConfig) -> Result<LessonforgeConfig, PipelineError> {
        config.validate().map_err(|errors| {
            let error_msgs: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            PipelineError::Config(format!(
                "Configuration validation failed:\n{}",
                error_msgs.join("\n")
            ))
        })?;
        Ok(config)
    }
}
