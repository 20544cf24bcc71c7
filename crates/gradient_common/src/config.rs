//! Runner configuration.
//!
//! Loads settings from $GRADIENT_CONFIG or <config dir>/gradient/config.toml,
//! falling back to defaults when no file exists.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::ToolboxError;

/// Environment variable overriding the config file location
pub const CONFIG_ENV: &str = "GRADIENT_CONFIG";

/// Default toolbox repository
pub const DEFAULT_TOOLBOX_REPO: &str = "https://gradient.engineer/toolbox/";

/// Settings shared by the fetch, execution and summary stages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Repository prefix the archive name is appended to
    #[serde(default = "default_toolbox_repo")]
    pub toolbox_repo: String,

    /// Per-diagnostic timeout when the playbook declares none
    #[serde(default = "default_timeout_secs")]
    pub default_timeout_secs: u64,

    /// Number of trailing output lines kept per diagnostic
    #[serde(default = "default_max_output_lines")]
    pub max_output_lines: usize,

    /// Grace period between SIGTERM and SIGKILL for expired diagnostics
    #[serde(default = "default_kill_grace_ms")]
    pub kill_grace_ms: u64,

    /// Progress indicator tick interval
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Request timeout for the summarization call
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,
}

fn default_toolbox_repo() -> String {
    DEFAULT_TOOLBOX_REPO.to_string()
}

fn default_timeout_secs() -> u64 {
    5
}

fn default_max_output_lines() -> usize {
    100
}

fn default_kill_grace_ms() -> u64 {
    2000
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_summary_timeout_secs() -> u64 {
    120
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            toolbox_repo: default_toolbox_repo(),
            default_timeout_secs: default_timeout_secs(),
            max_output_lines: default_max_output_lines(),
            kill_grace_ms: default_kill_grace_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            summary_timeout_secs: default_summary_timeout_secs(),
        }
    }
}

impl RunnerConfig {
    /// Zero would expire every diagnostic at spawn, so it means "use the default"
    pub fn default_timeout(&self) -> Duration {
        match self.default_timeout_secs {
            0 => Duration::from_secs(default_timeout_secs()),
            secs => Duration::from_secs(secs),
        }
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(10))
    }

    pub fn summary_timeout(&self) -> Duration {
        Duration::from_secs(self.summary_timeout_secs)
    }

    /// Location searched when no explicit path is given
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        dirs::config_dir().map(|d| d.join("gradient").join("config.toml"))
    }

    /// Load from an explicit path, or the default location.
    ///
    /// A missing file yields defaults; a malformed one is an error.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ToolboxError> {
        let path = match explicit {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if !path.exists() {
            if explicit.is_some() {
                return Err(ToolboxError::Config {
                    path,
                    reason: "config file does not exist".to_string(),
                });
            }
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)?;
        let config = Self::from_toml(&content).map_err(|reason| ToolboxError::Config {
            path: path.clone(),
            reason,
        })?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunnerConfig::default();
        assert_eq!(config.toolbox_repo, DEFAULT_TOOLBOX_REPO);
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
        assert_eq!(config.max_output_lines, 100);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = RunnerConfig::from_toml(
            r#"
toolbox_repo = "file:///srv/toolboxes/"
default_timeout_secs = 12
"#,
        )
        .unwrap();
        assert_eq!(config.toolbox_repo, "file:///srv/toolboxes/");
        assert_eq!(config.default_timeout_secs, 12);
        assert_eq!(config.kill_grace_ms, 2000);
        assert_eq!(config.tick_interval_ms, 100);
    }

    #[test]
    fn test_zero_timeout_falls_back_to_default() {
        let config = RunnerConfig::from_toml("default_timeout_secs = 0\n").unwrap();
        assert_eq!(config.default_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_malformed_toml_is_rejected() {
        assert!(RunnerConfig::from_toml("default_timeout_secs = \"soon\"").is_err());
    }

    #[test]
    fn test_missing_explicit_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");
        assert!(RunnerConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "max_output_lines = 20\n").unwrap();
        let config = RunnerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.max_output_lines, 20);
    }
}
