use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::write_json;
use crate::pattern::{ExclusionSet, PatternError};

const DEFAULT_UPDATE_URL: &str = "https://api.github.com/repos/kilobyteno/dagr-device/releases/latest";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid excluded_files entry: {0}")]
    Pattern(#[from] PatternError),
    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Persisted update policy (`update_config.json`).
///
/// Every field has a serde default, so partial files written by older
/// releases load cleanly.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct UpdateConfig {
    #[serde(default)]
    pub auto_update: bool,

    #[serde(default = "default_update_channel")]
    pub update_channel: String,

    #[serde(default = "default_true")]
    pub backup_before_update: bool,

    #[serde(default = "default_true")]
    pub restart_after_update: bool,

    #[serde(default = "default_update_url")]
    pub update_url: String,

    #[serde(default = "default_excluded_files")]
    pub excluded_files: Vec<String>,

    #[serde(default = "default_critical_files")]
    pub critical_files: Vec<PathBuf>,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    /// Paths (relative to the installation root) captured by a backup.
    #[serde(default = "default_backup_paths")]
    pub backup_paths: Vec<PathBuf>,

    /// Entry points that get mode 0755 after every apply.
    #[serde(default = "default_executable_files")]
    pub executable_files: Vec<PathBuf>,

    /// `user:group` applied recursively after apply; skipped when unset.
    #[serde(default)]
    pub owner: Option<String>,

    #[serde(default = "default_check_timeout")]
    pub check_timeout_secs: u64,

    #[serde(default = "default_download_timeout")]
    pub download_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_update_channel() -> String {
    "stable".to_string()
}

fn default_update_url() -> String {
    DEFAULT_UPDATE_URL.to_string()
}

fn default_excluded_files() -> Vec<String> {
    [
        "config/*.json",
        "config/tokens.json",
        "config/.key",
        "config/backups/*",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

fn default_critical_files() -> Vec<PathBuf> {
    [
        "src/dagr.py",
        "src/display_manager.py",
        "src/version.py",
        "install/install.sh",
        "install/dagr.service",
    ]
    .into_iter()
    .map(PathBuf::from)
    .collect()
}

fn default_service_name() -> String {
    "dagr".to_string()
}

fn default_backup_paths() -> Vec<PathBuf> {
    ["src", "install", "VERSION"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_executable_files() -> Vec<PathBuf> {
    ["install/dagr", "src/dagr_display", "src/dagr_update"]
        .into_iter()
        .map(PathBuf::from)
        .collect()
}

fn default_check_timeout() -> u64 {
    10
}

fn default_download_timeout() -> u64 {
    300
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            auto_update: false,
            update_channel: default_update_channel(),
            backup_before_update: true,
            restart_after_update: true,
            update_url: default_update_url(),
            excluded_files: default_excluded_files(),
            critical_files: default_critical_files(),
            service_name: default_service_name(),
            backup_paths: default_backup_paths(),
            executable_files: default_executable_files(),
            owner: None,
            check_timeout_secs: default_check_timeout(),
            download_timeout_secs: default_download_timeout(),
        }
    }
}

impl UpdateConfig {
    /// Load the configuration from `path`, writing the defaults back when the
    /// file does not exist yet.
    ///
    /// # Errors
    /// Returns an error when an existing file cannot be read or parsed, or
    /// when the loaded values fail validation. A failure to write the
    /// defaults is only logged.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })?
        } else {
            let config = Self::default();
            match config.save(path) {
                Ok(()) => info!("Wrote default update config to {}", path.display()),
                Err(error) => warn!("Could not save default update config: {error}"),
            }
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Persist the configuration atomically.
    ///
    /// # Errors
    /// Returns an error when the file cannot be written.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        write_json(path, self).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check values that serde cannot express.
    ///
    /// # Errors
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.exclusions()?;

        if self.check_timeout_secs == 0 {
            return Err(invalid("check_timeout_secs", "must be greater than zero"));
        }
        if self.download_timeout_secs == 0 {
            return Err(invalid("download_timeout_secs", "must be greater than zero"));
        }
        if self.service_name.trim().is_empty() {
            return Err(invalid("service_name", "must not be empty"));
        }
        for path in self
            .backup_paths
            .iter()
            .chain(&self.critical_files)
            .chain(&self.executable_files)
        {
            if !is_contained_relative(path) {
                return Err(invalid(
                    "paths",
                    format!("'{}' must be relative to the installation root", path.display()),
                ));
            }
        }
        if let Some(owner) = &self.owner
            && owner.trim().is_empty()
        {
            return Err(invalid("owner", "must not be empty when set"));
        }
        Ok(())
    }

    /// Compiled form of `excluded_files`.
    ///
    /// # Errors
    /// Returns an error when a pattern is invalid.
    pub fn exclusions(&self) -> Result<ExclusionSet, PatternError> {
        ExclusionSet::new(&self.excluded_files)
    }

    #[must_use]
    pub fn check_timeout(&self) -> Duration {
        Duration::from_secs(self.check_timeout_secs)
    }

    #[must_use]
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_secs)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

pub(crate) fn is_contained_relative(path: &Path) -> bool {
    use std::path::Component;

    path.components().next().is_some()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}
