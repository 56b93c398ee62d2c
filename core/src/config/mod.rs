//! Configuration management for Editor Fleet
//!
//! This module provides a hierarchical configuration system with the
//! following precedence:
//! 1. CLI Arguments (highest priority)
//! 2. Environment Variables (prefixed with EDITOR_FLEET_)
//! 3. Config Files (~/.config/editor-fleet/config.toml)
//! 4. Defaults (lowest priority)
//!
//! # Examples
//!
//! ```no_run
//! use editor_fleet_core::config::ConfigLoader;
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Load configuration with all sources
//! let config = ConfigLoader::new().load()?;
//!
//! // Load from a specific file
//! let config = ConfigLoader::new()
//!     .with_file("/path/to/config.toml")
//!     .load()?;
//! # Ok(())
//! # }
//! ```

pub mod models;

use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde_valid::Validate;
use std::path::{Path, PathBuf};

pub use models::{CoordinationConfig, FleetConfig, ModeOverride, WorkspaceSettings};

/// Default configuration file name
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default configuration directory name
const CONFIG_DIR_NAME: &str = "editor-fleet";

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "EDITOR_FLEET";

/// Environment variable separator for nested configuration
/// Example: EDITOR_FLEET_COORDINATION__MASTER_PORT
const ENV_SEPARATOR: &str = "__";

/// Configuration loader with builder pattern
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Optional custom configuration file path
    custom_file: Option<PathBuf>,
    /// Whether to skip loading from the default config file
    skip_default_file: bool,
    /// Whether to skip loading from environment variables
    skip_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Specify a custom configuration file path
    ///
    /// This will be used instead of the default config file location.
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.custom_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Skip loading from the default configuration file
    pub fn skip_default_file(mut self) -> Self {
        self.skip_default_file = true;
        self
    }

    /// Skip loading from environment variables
    pub fn skip_env(mut self) -> Self {
        self.skip_env = true;
        self
    }

    /// Load the configuration from all sources
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file parsing fails
    /// - Environment variable format is invalid
    /// - Validation fails (an empty or inverted port range is fatal here)
    pub fn load(&self) -> Result<FleetConfig> {
        let mut builder = ConfigBuilder::builder();

        // Start with defaults serialized to a map
        let defaults = FleetConfig::default();
        let defaults_map = config_to_map(&defaults)?;
        builder = builder.add_source(config::Config::try_from(&defaults_map)?);

        // Load from config file if not skipped
        if !self.skip_default_file {
            if let Some(config_path) = self.find_config_file() {
                tracing::debug!("Loading config from: {}", config_path.display());
                builder = builder.add_source(
                    File::from(config_path)
                        .required(false)
                        .format(config::FileFormat::Toml),
                );
            } else {
                tracing::debug!("No default config file found");
            }
        }

        // Load from custom file if specified
        if let Some(ref custom_path) = self.custom_file {
            tracing::debug!("Loading custom config from: {}", custom_path.display());
            builder = builder.add_source(
                File::from(custom_path.as_ref())
                    .required(true)
                    .format(config::FileFormat::Toml),
            );
        }

        // Load from environment variables if not skipped
        if !self.skip_env {
            builder = builder.add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            );
        }

        let config_result = builder.build().context("Failed to build configuration")?;

        let config: FleetConfig = config_result
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;
        config
            .coordination
            .ensure_valid()
            .map_err(|e| anyhow::anyhow!("Configuration validation failed: {}", e))?;

        Ok(config)
    }

    /// Find the default configuration file
    ///
    /// Searches the platform config directory first, then the current
    /// directory.
    fn find_config_file(&self) -> Option<PathBuf> {
        if let Some(config_dir) = dirs::config_dir() {
            let config_path = config_dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME);
            if config_path.exists() {
                return Some(config_path);
            }
        }

        let local_config = PathBuf::from(CONFIG_FILE_NAME);
        if local_config.exists() {
            return Some(local_config);
        }

        None
    }

    /// Get the default configuration directory path
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME))
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        Self::default_config_dir().map(|dir| dir.join(CONFIG_FILE_NAME))
    }
}

/// Helper to convert the default config into a source the builder accepts
fn config_to_map(config: &FleetConfig) -> Result<serde_json::Value, ConfigError> {
    serde_json::to_value(config).map_err(|e| ConfigError::Foreign(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_defaults() {
        let config = ConfigLoader::new()
            .skip_default_file()
            .skip_env()
            .load()
            .expect("defaults load");

        assert!(config.coordination.enabled);
        assert_eq!(config.coordination.master_port, 9100);
        assert_eq!(config.coordination.mode, ModeOverride::Auto);
    }

    #[test]
    fn test_load_custom_file_overrides() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[coordination]\nmaster_port = 9300\nworker_port_start = 9301\nworker_port_end = 9350\nheartbeat_interval_secs = 2"
        )
        .expect("write config");

        let config = ConfigLoader::new()
            .skip_default_file()
            .skip_env()
            .with_file(file.path())
            .load()
            .expect("custom file load");

        assert_eq!(config.coordination.master_port, 9300);
        assert_eq!(config.coordination.worker_port_start, 9301);
        assert_eq!(config.coordination.heartbeat_interval_secs, 2);
        // Untouched fields keep their defaults.
        assert_eq!(config.coordination.election_timeout_secs, 5);
    }

    #[test]
    fn test_invalid_port_range_is_fatal() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(
            file,
            "[coordination]\nworker_port_start = 9199\nworker_port_end = 9101"
        )
        .expect("write config");

        let result = ConfigLoader::new()
            .skip_default_file()
            .skip_env()
            .with_file(file.path())
            .load();

        assert!(result.is_err());
    }
}
