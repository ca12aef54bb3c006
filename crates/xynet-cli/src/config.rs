//! Configuration management for the xynet CLI

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

/// Global CLI configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Default logging level
    pub log_level: Option<String>,

    /// Seed used when `compile` gets no `--seed`
    pub default_seed: Option<u64>,

    /// Output expressions used when `compile` gets no `--print`
    pub default_outputs: Vec<String>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            log_level: Some("info".to_string()),
            default_seed: None,
            default_outputs: Vec::new(),
        }
    }
}

impl CliConfig {
    /// Load configuration from file; a missing file yields the defaults
    pub fn load_from_file(path: &Path) -> CliResult<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| CliError::config(format!("Invalid config file: {}", e)))
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save_to_file(&self, path: &Path) -> CliResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| CliError::config(format!("Failed to serialize config: {}", e)))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(path, content)?;
        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> CliResult<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| CliError::config("Could not determine config directory"))?;
        Ok(config_dir.join("xynet").join("config.toml"))
    }

    /// Load from an explicit `--config` path (which must exist) or from the
    /// default location (which may not)
    pub fn load(explicit: Option<&Path>) -> CliResult<Self> {
        match explicit {
            Some(path) if !path.exists() => Err(CliError::missing_resource(format!(
                "config file {}",
                path.display()
            ))),
            Some(path) => Self::load_from_file(path),
            None => match Self::default_config_path() {
                Ok(path) => Self::load_from_file(&path),
                Err(_) => Ok(Self::default()),
            },
        }
    }
}
