use std::path::{Path, PathBuf};

use log::{debug, info, warn};
use thiserror::Error;

use crate::fsutil::{copy_file, relative_files};
use crate::pattern::ExclusionSet;
use crate::validate::VERSION_MARKER;

const STAGING_PREFIX: &str = ".dagr-staging";

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to commit update after {applied} of {total} files: {source}")]
    Commit {
        applied: usize,
        total: usize,
        #[source]
        source: std::io::Error,
    },
}

impl ApplyError {
    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::Io {
            context,
            source: std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        }
    }
}

/// Post-apply permission fixes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PermissionPolicy {
    /// Paths relative to the installation root that must end up executable.
    pub executables: Vec<PathBuf>,
    /// `user:group` passed to `chown -R`; skipped when unset.
    pub owner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub content_root: PathBuf,
    pub applied: Vec<PathBuf>,
    pub excluded: Vec<PathBuf>,
}

/// Copies a validated package over the installation.
#[derive(Debug, Clone)]
pub struct Installer {
    exclusions: ExclusionSet,
    permissions: PermissionPolicy,
}

impl Installer {
    #[must_use]
    pub fn new(exclusions: ExclusionSet, permissions: PermissionPolicy) -> Self {
        Self {
            exclusions,
            permissions,
        }
    }

    /// Copy every non-excluded file under `content_root` into `install_root`.
    ///
    /// `content_root` is the directory holding the validated `VERSION`
    /// marker, so its layout mirrors the installation. Files are first staged in a hidden directory inside `install_root` and
    /// then renamed into place, so a failure while reading the package leaves
    /// the installation untouched. Excluded paths are never written.
    ///
    /// # Errors
    /// Returns [`ApplyError::Io`] when staging fails (nothing was changed) and
    /// [`ApplyError::Commit`] when moving staged files into place fails.
    pub fn apply(&self, content_root: &Path, install_root: &Path) -> Result<ApplyReport, ApplyError> {
        info!(
            "Applying update from {} to {}",
            content_root.display(),
            install_root.display()
        );

        let files = relative_files(content_root).map_err(|error| {
            ApplyError::io_with_path("failed to scan update package", content_root, &error)
        })?;
        let (excluded, mut included): (Vec<PathBuf>, Vec<PathBuf>) = files
            .into_iter()
            .partition(|file| self.exclusions.is_excluded(file));
        // The marker goes last so it only changes once everything else landed.
        included.sort_by_key(|file| file.as_os_str() == VERSION_MARKER);
        for file in &excluded {
            debug!("Skipping excluded file: {}", file.display());
        }

        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(install_root)
            .map_err(|error| {
                ApplyError::io_with_path("failed to create staging directory", install_root, &error)
            })?;

        for file in &included {
            let source = content_root.join(file);
            let staged = staging.path().join(file);
            copy_file(&source, &staged).map_err(|error| {
                ApplyError::io_with_path("failed to stage update file", &source, &error)
            })?;
            self.set_staged_mode(file, &staged)?;
        }

        let total = included.len();
        for (applied, file) in included.iter().enumerate() {
            let target = install_root.join(file);
            let result = target
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|()| std::fs::rename(staging.path().join(file), &target));
            if let Err(source) = result {
                return Err(ApplyError::Commit {
                    applied,
                    total,
                    source: std::io::Error::new(
                        source.kind(),
                        format!("{}: {source}", target.display()),
                    ),
                });
            }
        }

        self.fix_permissions(install_root);
        info!(
            "Applied {total} files ({} excluded)",
            excluded.len()
        );

        Ok(ApplyReport {
            content_root: content_root.to_path_buf(),
            applied: included,
            excluded,
        })
    }

    #[cfg(unix)]
    fn set_staged_mode(&self, relative: &Path, staged: &Path) -> Result<(), ApplyError> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = std::fs::metadata(staged).map_err(|error| {
            ApplyError::io_with_path("failed to read staged file metadata", staged, &error)
        })?;
        let executable = metadata.permissions().mode() & 0o111 != 0
            || self.permissions.executables.iter().any(|exe| exe == relative);
        let mode = if executable { 0o755 } else { 0o644 };
        std::fs::set_permissions(staged, std::fs::Permissions::from_mode(mode)).map_err(|error| {
            ApplyError::io_with_path("failed to set staged file permissions", staged, &error)
        })
    }

    #[cfg(not(unix))]
    fn set_staged_mode(&self, _relative: &Path, _staged: &Path) -> Result<(), ApplyError> {
        Ok(())
    }

    fn fix_permissions(&self, install_root: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            for exe in &self.permissions.executables {
                let path = install_root.join(exe);
                if path.is_file()
                    && let Err(error) =
                        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
                {
                    warn!("Could not make {} executable: {error}", path.display());
                }
            }
        }

        if let Some(owner) = &self.permissions.owner {
            match std::process::Command::new("chown")
                .arg("-R")
                .arg(owner)
                .arg(install_root)
                .output()
            {
                Ok(output) if output.status.success() => {
                    debug!("Set ownership of {} to {owner}", install_root.display());
                }
                Ok(output) => warn!(
                    "chown {owner} failed: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
                Err(error) => warn!("Could not run chown: {error}"),
            }
        }
    }
}
