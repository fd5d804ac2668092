use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use thiserror::Error;
use walkdir::WalkDir;

use crate::version::{Version, VersionParseError};

/// File name of the version marker in packages and installations.
pub const VERSION_MARKER: &str = "VERSION";

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("no VERSION file found in update package")]
    MissingVersionMarker,
    #[error("invalid VERSION file {}: {source}", .path.display())]
    InvalidVersion {
        path: PathBuf,
        #[source]
        source: VersionParseError,
    },
    #[error("update version {candidate} is not newer than current {current}")]
    NotNewer { candidate: Version, current: Version },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// A package that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPackage {
    pub version: Version,
    pub marker: PathBuf,
    /// Directory holding `marker`; its layout mirrors the installation root.
    pub content_root: PathBuf,
    pub missing_critical: Vec<PathBuf>,
}

/// Check an extracted package against the running installation.
///
/// Hard checks: a `VERSION` marker exists somewhere in the tree and its
/// version is strictly newer than `current`. Missing critical files are
/// reported as warnings only.
///
/// # Errors
/// Returns an error when a hard check fails or the tree cannot be read.
pub fn validate(
    extracted: &Path,
    current: &Version,
    critical_files: &[PathBuf],
) -> Result<ValidatedPackage, ValidationError> {
    info!("Validating update package");

    let marker = find_version_marker(extracted)
        .map_err(|source| ValidationError::Io {
            context: "failed to scan update package",
            source,
        })?
        .ok_or_else(|| {
            error!("No VERSION file found in update");
            ValidationError::MissingVersionMarker
        })?;

    let content = std::fs::read_to_string(&marker).map_err(|source| ValidationError::Io {
        context: "failed to read package VERSION file",
        source,
    })?;
    let version = Version::parse(&content).map_err(|source| ValidationError::InvalidVersion {
        path: marker.clone(),
        source,
    })?;

    if version <= *current {
        error!("Update version {version} is not newer than current {current}");
        return Err(ValidationError::NotNewer {
            candidate: version,
            current: current.clone(),
        });
    }

    let content_root = marker.parent().unwrap_or(extracted).to_path_buf();
    let missing_critical = critical_files
        .iter()
        .filter(|critical| !critical_file_present(extracted, &content_root, critical))
        .cloned()
        .collect::<Vec<_>>();
    for critical in &missing_critical {
        warn!("Critical file not found in update: {}", critical.display());
    }

    info!("Update package validation successful ({version})");
    Ok(ValidatedPackage {
        version,
        marker,
        content_root,
        missing_critical,
    })
}

/// Shallowest `VERSION` file under `root`, ties broken by path order.
pub(crate) fn find_version_marker(root: &Path) -> std::io::Result<Option<PathBuf>> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        if !entry.file_type().is_file() || entry.file_name() != VERSION_MARKER {
            continue;
        }
        if best.as_ref().is_none_or(|(depth, _)| entry.depth() < *depth) {
            best = Some((entry.depth(), entry.into_path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

fn critical_file_present(extracted: &Path, content_root: &Path, critical: &Path) -> bool {
    if content_root.join(critical).is_file() {
        return true;
    }
    let Some(name) = critical.file_name() else {
        return false;
    };
    let found = WalkDir::new(extracted)
        .into_iter()
        .filter_map(Result::ok)
        .any(|entry| entry.file_type().is_file() && entry.file_name() == name);
    if found {
        debug!(
            "Critical file {} found outside its expected location",
            critical.display()
        );
    }
    found
}
