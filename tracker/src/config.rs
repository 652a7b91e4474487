//! Configuration module for Kimai Autotrack.
//!
//! Configuration is a small JSON record persisted in the user's config
//! directory. Environment variables override individual fields, which keeps
//! headless and test setups free of files.
//!
//! # File
//!
//! `$XDG_CONFIG_HOME/kimai-tracker/config.json` (or `~/.config/...`):
//!
//! ```json
//! {
//!   "baseUrl": "https://kimai.example.com",
//!   "token": "secret",
//!   "idleTimeoutSeconds": 600,
//!   "pollIntervalSeconds": 15,
//!   "defaultProjectId": 7,
//!   "defaultActivityId": 3,
//!   "idleBackend": "gnome"
//! }
//! ```
//!
//! # Environment Variables
//!
//! | Variable | Overrides |
//! |----------|-----------|
//! | `KIMAI_TRACKER_CONFIG` | Path of the config file itself |
//! | `KIMAI_TRACKER_URL` | `baseUrl` |
//! | `KIMAI_TRACKER_TOKEN` | `token` |
//! | `KIMAI_TRACKER_IDLE_TIMEOUT_SECS` | `idleTimeoutSeconds` |
//! | `KIMAI_TRACKER_POLL_INTERVAL_SECS` | `pollIntervalSeconds` |
//! | `KIMAI_TRACKER_PROJECT` | `defaultProjectId` |
//! | `KIMAI_TRACKER_ACTIVITY` | `defaultActivityId` |
//!
//! # Example
//!
//! ```no_run
//! use kimai_autotrack::config::Config;
//!
//! let config = Config::load().expect("Failed to load configuration");
//! println!("Kimai URL: {}", config.base_url);
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::types::{ActivityId, Attribution, ProjectId};

/// Directory name below the user's config directory.
const CONFIG_DIR_NAME: &str = "kimai-tracker";

/// Config file name.
const CONFIG_FILE_NAME: &str = "config.json";

/// Default idle timeout (10 minutes).
const DEFAULT_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default poll interval.
const DEFAULT_POLL_INTERVAL_SECS: u64 = 15;

/// Errors that can occur while loading, validating or saving configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A required field is empty or missing.
    #[error("missing required setting: {0}")]
    Missing(String),

    /// A field or environment variable has an invalid value.
    #[error("invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Failed to determine home directory.
    #[error("failed to determine home directory")]
    NoHomeDirectory,

    /// Reading or writing the config file failed.
    #[error("config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The config file is not valid JSON for this schema.
    #[error("config file {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Which desktop service answers "milliseconds since last input".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdleBackend {
    /// `org.gnome.Mutter.IdleMonitor` over the session bus (Wayland and X11).
    #[default]
    Gnome,
    /// The `xprintidle` utility (X11 only).
    Xprintidle,
}

/// Configuration for Kimai Autotrack.
///
/// Immutable during a run; the engine replaces it wholesale on reload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Kimai base URL without the `/api` suffix.
    pub base_url: String,

    /// API bearer token.
    pub token: String,

    pub idle_timeout_seconds: u64,

    pub poll_interval_seconds: u64,

    pub default_project_id: Option<ProjectId>,

    pub default_activity_id: Option<ActivityId>,

    pub idle_backend: IdleBackend,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            token: String::new(),
            idle_timeout_seconds: DEFAULT_IDLE_TIMEOUT_SECS,
            poll_interval_seconds: DEFAULT_POLL_INTERVAL_SECS,
            default_project_id: None,
            default_activity_id: None,
            idle_backend: IdleBackend::default(),
        }
    }
}

impl Config {
    /// Loads the config file (if any), applies environment overrides and
    /// validates the result.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if the file cannot be read or parsed, an
    /// environment variable is malformed, or validation fails.
    pub fn load() -> Result<Self, ConfigError> {
        let path = default_path()?;
        let mut config = Self::from_file(&path)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a config file, falling back to defaults when it does not exist.
    ///
    /// No validation is performed so that a partially filled file can still be
    /// edited and saved.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        serde_json::from_str(&contents).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Writes the config as pretty JSON, creating parent directories.
    ///
    /// A running tracker picks the change up on `SIGHUP` (see
    /// [`EngineHandle::reload`](crate::engine::EngineHandle::reload)).
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let io_err = |source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(io_err)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(|source| ConfigError::Malformed {
            path: path.to_path_buf(),
            source,
        })?;
        fs::write(path, json).map_err(io_err)?;

        info!(path = %path.display(), "Configuration saved");
        Ok(())
    }

    /// Records a new default attribution in the file at `path`.
    ///
    /// Only the file contents are rewritten; environment overrides are not
    /// persisted.
    pub fn store_defaults(path: &Path, attribution: Attribution) -> Result<Self, ConfigError> {
        let mut config = Self::from_file(path)?;
        config.default_project_id = Some(attribution.project);
        config.default_activity_id = Some(attribution.activity);
        config.save(path)?;
        Ok(config)
    }

    /// Overrides fields from `KIMAI_TRACKER_*` environment variables.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Ok(url) = env::var("KIMAI_TRACKER_URL") {
            self.base_url = url;
        }
        if let Ok(token) = env::var("KIMAI_TRACKER_TOKEN") {
            self.token = token;
        }
        if let Some(secs) = parse_env_u64("KIMAI_TRACKER_IDLE_TIMEOUT_SECS")? {
            self.idle_timeout_seconds = secs;
        }
        if let Some(secs) = parse_env_u64("KIMAI_TRACKER_POLL_INTERVAL_SECS")? {
            self.poll_interval_seconds = secs;
        }
        if let Some(project) = parse_env_u64("KIMAI_TRACKER_PROJECT")? {
            self.default_project_id = Some(project);
        }
        if let Some(activity) = parse_env_u64("KIMAI_TRACKER_ACTIVITY")? {
            self.default_activity_id = Some(activity);
        }
        Ok(())
    }

    /// Checks the invariants the engine relies on.
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if:
    /// - `baseUrl` or `token` is empty
    /// - `baseUrl` is not an http(s) URL
    /// - either duration is zero
    /// - only one of the default project/activity is set
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Missing("baseUrl".to_string()));
        }
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(ConfigError::InvalidValue {
                key: "baseUrl".to_string(),
                message: format!("expected http(s) URL, got '{}'", self.base_url),
            });
        }
        if self.token.trim().is_empty() {
            return Err(ConfigError::Missing("token".to_string()));
        }
        if self.idle_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "idleTimeoutSeconds".to_string(),
                message: "idle timeout must be at least 1 second".to_string(),
            });
        }
        if self.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                key: "pollIntervalSeconds".to_string(),
                message: "poll interval must be at least 1 second".to_string(),
            });
        }
        if self.default_project_id.is_some() != self.default_activity_id.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "defaultActivityId".to_string(),
                message: "default project and activity must be set together".to_string(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    /// The default attribution, if both ids are configured.
    #[must_use]
    pub fn defaults(&self) -> Option<Attribution> {
        match (self.default_project_id, self.default_activity_id) {
            (Some(project), Some(activity)) => Some(Attribution::new(project, activity)),
            _ => None,
        }
    }
}

/// Returns the config file path, honouring `KIMAI_TRACKER_CONFIG`.
pub fn default_path() -> Result<PathBuf, ConfigError> {
    if let Ok(path) = env::var("KIMAI_TRACKER_CONFIG") {
        return Ok(PathBuf::from(path));
    }

    let base_dirs = BaseDirs::new().ok_or(ConfigError::NoHomeDirectory)?;
    Ok(base_dirs
        .config_dir()
        .join(CONFIG_DIR_NAME)
        .join(CONFIG_FILE_NAME))
}

fn parse_env_u64(key: &str) -> Result<Option<u64>, ConfigError> {
    match env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("expected non-negative integer, got '{val}'"),
            }),
        Err(_) => Ok(None),
    }
}
