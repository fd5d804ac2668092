use thiserror::Error;

use crate::backup::BackupError;
use crate::config::ConfigError;
use crate::extract::ExtractError;
use crate::fetch::FetchError;
use crate::install::ApplyError;
use crate::lock::LockError;
use crate::rollback::RestoreError;
use crate::validate::ValidationError;
use crate::version_store::VersionStoreError;

/// Why an update or rollback did not complete.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("no download URL: the release has no archive asset")]
    NoDownloadUrl,
    #[error("network error: {0}")]
    Network(#[from] FetchError),
    #[error("archive error: {0}")]
    Archive(#[from] ExtractError),
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("backup failed: {0}")]
    Backup(#[from] BackupError),
    #[error("apply failed: {source}{}", restored_note(.restored_from.as_deref()))]
    Apply {
        #[source]
        source: ApplyError,
        restored_from: Option<String>,
    },
    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),
    #[error("failed to record installed version: {0}")]
    Version(#[from] VersionStoreError),
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

fn restored_note(restored_from: Option<&str>) -> String {
    restored_from.map_or_else(String::new, |name| format!(" (restored backup '{name}')"))
}

impl UpdateError {
    /// Whether the installation may be left partially overwritten.
    #[must_use]
    pub fn installation_inconsistent(&self) -> bool {
        matches!(
            self,
            Self::Apply {
                source: ApplyError::Commit { .. },
                restored_from: None,
            } | Self::Restore(RestoreError::Io { .. })
        )
    }
}
