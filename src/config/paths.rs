//! XDG-style locations for the global config file and the default data directory.

use directories::ProjectDirs;
use std::path::PathBuf;

const APP_NAME: &str = "lessonforge";

/// `$XDG_CONFIG_HOME`, falling back to `$HOME/.config`.
pub fn config_home() -> Option<PathBuf> {
    std::env::var_os("XDG_CONFIG_HOME")
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
}

/// Path to the global config file.
pub fn global_config_path() -> Option<PathBuf> {
    config_home().map(|dir| dir.join(APP_NAME).join("config.toml"))
}

/// Where sled databases live unless `storage.data_dir` says otherwise.
pub fn default_data_dir() -> PathBuf {
    ProjectDirs::from("", "", APP_NAME)
        .map(|dirs| dirs.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".lessonforge"))
}
