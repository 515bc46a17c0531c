//! Configuration for PTY allocation
//!
//! Precedence: environment variables > config file > defaults.
//! The config file lives at `$XDG_CONFIG_HOME/ptyio/config.toml` unless an
//! explicit path is given.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::pty::{Accounting, HelperVerbs};
use crate::size::WindowSize;

pub const ENV_GRANT_HELPER: &str = "PTYIO_GRANT_HELPER";
pub const ENV_UTEMPTER: &str = "PTYIO_UTEMPTER";
pub const ENV_NO_CTTY: &str = "PTYIO_NO_CTTY";

/// Configuration error
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config error in '{field}': {message}")]
    Invalid { field: String, message: String },
}

/// Settings shared by every [`Pty`](crate::Pty) built from this config
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PtyConfig {
    /// Make the slave the controlling terminal of spawned sessions
    pub controlling_tty: bool,
    /// Helper used to fix legacy device permissions; `None` disables it
    pub grant_helper: Option<PathBuf>,
    /// Login record backend
    pub accounting: Accounting,
    /// Size applied to new sessions
    pub window_size: WindowSize,
}

impl Default for PtyConfig {
    fn default() -> Self {
        PtyConfig {
            controlling_tty: true,
            grant_helper: Some(PathBuf::from("/usr/libexec/ptyio/grantpty")),
            accounting: Accounting::Disabled,
            window_size: WindowSize::default(),
        }
    }
}

impl PtyConfig {
    /// Load from the default location (if present), then apply the environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_path(None)
    }

    /// Like [`load`](Self::load), reading `path` instead of the default file.
    /// An explicit path must exist; a missing default file is not an error.
    pub fn load_with_path(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_config_path() {
                Some(path) if path.exists() => match Self::load_from_file(&path) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!("Failed to load config from {:?}: {}", path, e);
                        PtyConfig::default()
                    }
                },
                _ => PtyConfig::default(),
            },
        };

        config.apply_env_vars();
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env_vars(&mut self) {
        self.apply_env(|key| env::var(key).ok());
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(val) = lookup(ENV_GRANT_HELPER) {
            self.grant_helper = if val.is_empty() {
                None
            } else {
                Some(PathBuf::from(val))
            };
        }
        if let Some(val) = lookup(ENV_UTEMPTER) {
            if !val.is_empty() {
                self.accounting = Accounting::Utempter {
                    path: PathBuf::from(val),
                    verbs: HelperVerbs::default(),
                };
            }
        }
        if let Some(val) = lookup(ENV_NO_CTTY) {
            if val == "1" || val.eq_ignore_ascii_case("true") {
                self.controlling_tty = false;
            }
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.window_size.rows == 0 || self.window_size.cols == 0 {
            return Err(ConfigError::Invalid {
                field: "window_size".to_string(),
                message: "rows and cols must be non-zero".to_string(),
            });
        }

        if let Some(helper) = &self.grant_helper {
            if !helper.is_absolute() {
                return Err(ConfigError::Invalid {
                    field: "grant_helper".to_string(),
                    message: format!("helper path {:?} must be absolute", helper),
                });
            }
        }

        if let Accounting::Utempter { path, .. } = &self.accounting {
            if !path.is_absolute() {
                return Err(ConfigError::Invalid {
                    field: "accounting.path".to_string(),
                    message: format!("helper path {:?} must be absolute", path),
                });
            }
        }

        Ok(())
    }

    /// Get the default configuration file path
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("ptyio").join("config.toml"))
    }
}
