//! Configuration file resolution and TOML loading
//!
//! The run configuration is a TOML document. Its location is resolved with the
//! following priority order:
//! 1. Command-line argument (highest priority)
//! 2. Environment variable
//! 3. Per-user config file (`~/.config/flowa/flowa.toml` on Linux)
//!
//! There is no compiled default for the run configuration itself: an inversion
//! without an explicit configuration is a setup error.

use crate::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable naming the run configuration file
pub const CONFIG_ENV_VAR: &str = "FLOWA_CONFIG";

/// Config file name inside the per-user config directory
pub const CONFIG_FILE_NAME: &str = "flowa.toml";

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Console log level for the top-level process (per-event files use `level`)
    #[serde(default = "default_console_level")]
    pub console_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            console_level: default_console_level(),
        }
    }
}

fn default_log_level() -> String {
    "debug".to_string()
}

fn default_console_level() -> String {
    "info".to_string()
}

/// Resolve the run configuration file path
///
/// # Arguments
/// * `cli_arg` - Path given on the command line, if any
/// * `env_var_name` - Environment variable consulted second
///
/// # Returns
/// * Path to an existing configuration file
pub fn resolve_config_path(cli_arg: Option<&Path>, env_var_name: &str) -> Result<PathBuf> {
    // Priority 1: Command-line argument
    if let Some(path) = cli_arg {
        debug!("Using config from command line: {}", path.display());
        return existing(path.to_path_buf());
    }

    // Priority 2: Environment variable
    if let Ok(path) = std::env::var(env_var_name) {
        if !path.trim().is_empty() {
            debug!("Using config from {}: {}", env_var_name, path);
            return existing(PathBuf::from(path));
        }
    }

    // Priority 3: Per-user config directory
    match user_config_path() {
        Some(path) if path.exists() => {
            debug!("Using per-user config: {}", path.display());
            Ok(path)
        }
        Some(path) => Err(Error::Config(format!(
            "No configuration given. Use --config, set {} or create {}",
            env_var_name,
            path.display()
        ))),
        None => Err(Error::Config(format!(
            "No configuration given. Use --config or set {}",
            env_var_name
        ))),
    }
}

/// Per-user configuration file location for the platform
pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("flowa").join(CONFIG_FILE_NAME))
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    if path.is_file() {
        Ok(path)
    } else {
        Err(Error::Config(format!(
            "Config file not found: {}",
            path.display()
        )))
    }
}

/// Read and deserialize a TOML document
pub fn load_toml<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Read {} failed: {}", path.display(), e)))?;
    parse_toml(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))
}

/// Deserialize a TOML document from a string
pub fn parse_toml<T: DeserializeOwned>(content: &str) -> std::result::Result<T, toml::de::Error> {
    toml::from_str(content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_logging_defaults() {
        let logging = LoggingConfig::default();
        assert_eq!(logging.level, "debug");
        assert_eq!(logging.console_level, "info");
    }

    #[test]
    fn test_cli_path_must_exist() {
        let result = resolve_config_path(Some(Path::new("/nonexistent/flowa.toml")), "UNUSED_VAR");
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_parse_partial_logging_section() {
        let logging: LoggingConfig = parse_toml("level = \"warn\"").unwrap();
        assert_eq!(logging.level, "warn");
        assert_eq!(logging.console_level, "info");
    }
}
