//! Standard locations for dspsync files

use std::path::PathBuf;

/// Get the default config file path
///
/// Returns: ~/.config/dspsync/config.yaml
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join("dspsync")
        .join("config.yaml")
}
