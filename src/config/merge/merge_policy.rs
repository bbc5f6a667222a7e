//! Merge rules: defaults, override order, conflict handling.
//!
//! Later sources win key by key: defaults, then the global file, then the
//! workspace files, then `LESSONFORGE__SECTION__KEY` environment variables.

use config::builder::DefaultState;
use config::Config;
use config::ConfigBuilder;
use config::ConfigError;
use config::Environment;

use crate::config::paths;

/// Prefix shared by every environment override.
pub const ENV_PREFIX: &str = "LESSONFORGE";

/// Separates the section from the key in environment overrides.
pub const ENV_SEPARATOR: &str = "__";

/// Create a Config builder with merge policy defaults applied.
pub fn builder_with_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
    Config::builder()
        .set_default("provider.provider_type", "openai")?
        .set_default("provider.model", "gpt-4o")?
        .set_default(
            "storage.data_dir",
            paths::default_data_dir().to_string_lossy().into_owned(),
        )
}

/// Environment overrides, applied last.
pub fn add_environment(
    builder: ConfigBuilder<DefaultState>,
) -> ConfigBuilder<DefaultState> {
    builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator(ENV_SEPARATOR)
            .try_parsing(true),
    )
}
