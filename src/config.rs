// Configuration loading for ciboot
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{CibootError, ConfigError, Result};
use crate::shell::ShellDialect;

pub const DEFAULT_CONFIG_FILE: &str = "ciboot.yaml";
pub const DEFAULT_DOMAIN: &str = "public-travis-scripts.polysquare.org";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Domain logical scripts are fetched from
    pub domain: String,
    /// Dialect used for parent shell commands
    pub shell: ShellDialect,
    /// Seconds between heartbeat markers for long-running commands
    pub heartbeat_interval_secs: u64,
    pub download: DownloadConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DownloadConfig {
    pub attempts: usize,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            domain: DEFAULT_DOMAIN.to_string(),
            shell: ShellDialect::Bash,
            heartbeat_interval_secs: 30,
            download: DownloadConfig::default(),
        }
    }
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay_ms: 500,
            max_delay_ms: 8000,
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(CibootError::Config(Box::new(ConfigError::NotFound {
                path: path.to_path_buf(),
                suggestion: Some(format!(
                    "Create {} or pass --config with an existing file",
                    path.display()
                )),
            })));
        }

        if !path.is_file() {
            return Err(CibootError::Config(Box::new(ConfigError::InvalidValue {
                message: "Configuration path is not a file".to_string(),
                field: "config_path".to_string(),
                value: path.display().to_string(),
                expected: "file path".to_string(),
                file_path: Some(path.to_path_buf()),
            })));
        }

        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_with_context(&content, Some(path))
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Self::from_yaml_with_context(yaml, None)
    }

    /// Load `path` if it exists; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::from_file(path)
        } else {
            tracing::debug!(path = %path.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    fn from_yaml_with_context(yaml: &str, file_path: Option<&Path>) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty mapping.
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: Config = serde_yaml::from_str(yaml).map_err(|e| {
            let mut config_error = *Box::<ConfigError>::from(e);
            if let ConfigError::InvalidYaml {
                file_path: ref mut path,
                ..
            } = config_error
            {
                *path = file_path.map(Path::to_path_buf);
            }
            CibootError::Config(Box::new(config_error))
        })?;

        config.validate(file_path.map(Path::to_path_buf))?;
        Ok(config)
    }

    fn validate(&self, file_path: Option<PathBuf>) -> Result<()> {
        let invalid = |field: &str, value: String, expected: &str| {
            CibootError::Config(Box::new(ConfigError::InvalidValue {
                message: format!("{field} is out of range"),
                field: field.to_string(),
                value,
                expected: expected.to_string(),
                file_path: file_path.clone(),
            }))
        };

        if self.domain.trim().is_empty() {
            return Err(invalid("domain", self.domain.clone(), "a host name or URL"));
        }
        if self.heartbeat_interval_secs == 0 {
            return Err(invalid(
                "heartbeat_interval_secs",
                "0".to_string(),
                "a positive number of seconds",
            ));
        }
        if self.download.attempts == 0 {
            return Err(invalid(
                "download.attempts",
                "0".to_string(),
                "at least one attempt",
            ));
        }
        if self.download.max_delay_ms < self.download.initial_delay_ms {
            return Err(invalid(
                "download.max_delay_ms",
                self.download.max_delay_ms.to_string(),
                "a value no smaller than download.initial_delay_ms",
            ));
        }
        Ok(())
    }
}
