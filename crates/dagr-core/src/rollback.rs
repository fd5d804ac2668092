use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use dagr_platform::InstallPaths;
use log::{info, warn};
use thiserror::Error;

use crate::backup::{Backup, BackupError};
use crate::fsutil::{copy_file, write_atomic};
use crate::validate::VERSION_MARKER;
use crate::version::Version;

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error(transparent)]
    Backup(#[from] BackupError),
    #[error(
        "backup '{name}' does not match its manifest ({} missing, {} unexpected)",
        .missing.len(),
        .unexpected.len()
    )]
    ManifestMismatch {
        name: String,
        missing: Vec<String>,
        unexpected: Vec<String>,
    },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub backup: String,
    pub restored: usize,
    pub version: Version,
}

/// Copies a backup's files back over the installation root.
#[derive(Debug, Clone)]
pub struct RollbackEngine {
    project_root: PathBuf,
}

impl RollbackEngine {
    #[must_use]
    pub fn new(paths: &InstallPaths) -> Self {
        Self {
            project_root: paths.project_root.clone(),
        }
    }

    /// Restore `backup` after checking it still matches its manifest.
    ///
    /// # Errors
    /// Returns an error when the backup is incomplete or tampered with, or
    /// when copying fails part way.
    pub fn restore(&self, backup: &Backup) -> Result<RestoreReport, RestoreError> {
        verify(backup)?;
        info!("Restoring backup '{}'", backup.name);

        let mut restored = 0;
        for file in &backup.manifest.files {
            let relative = Path::new(file);
            let source = backup.path.join(relative);
            let target = self.project_root.join(relative);
            copy_file(&source, &target).map_err(|source_error| RestoreError::Io {
                context: "failed to restore file",
                source: std::io::Error::new(
                    source_error.kind(),
                    format!("{}: {source_error}", target.display()),
                ),
            })?;
            restored += 1;
        }

        if !backup.path.join(VERSION_MARKER).is_file() {
            warn!(
                "Backup '{}' has no VERSION file, writing {} from its manifest",
                backup.name, backup.manifest.version
            );
            write_atomic(
                &self.project_root.join(VERSION_MARKER),
                backup.manifest.version.to_string().as_bytes(),
            )
            .map_err(|source| RestoreError::Io {
                context: "failed to write restored VERSION file",
                source,
            })?;
        }

        info!("Restored {restored} files from backup '{}'", backup.name);
        Ok(RestoreReport {
            backup: backup.name.clone(),
            restored,
            version: backup.manifest.version.clone(),
        })
    }
}

fn verify(backup: &Backup) -> Result<(), RestoreError> {
    let expected: BTreeSet<&str> = backup.manifest.files.iter().map(String::as_str).collect();
    let actual_files = backup.actual_files()?;
    let actual: BTreeSet<&str> = actual_files.iter().map(String::as_str).collect();

    let missing: Vec<String> = expected
        .difference(&actual)
        .map(|file| (*file).to_string())
        .collect();
    let unexpected: Vec<String> = actual
        .difference(&expected)
        .map(|file| (*file).to_string())
        .collect();

    if missing.is_empty() && unexpected.is_empty() {
        return Ok(());
    }
    for file in &missing {
        warn!("Backup '{}' is missing {file}", backup.name);
    }
    for file in &unexpected {
        warn!("Backup '{}' has unlisted file {file}", backup.name);
    }
    Err(RestoreError::ManifestMismatch {
        name: backup.name.clone(),
        missing,
        unexpected,
    })
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use dagr_platform::InstallPaths;

    use super::{RestoreError, RollbackEngine};
    use crate::backup::BackupArchiver;
    use crate::version::Version;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("test path should have parent"))
            .expect("parent should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    fn setup() -> (tempfile::TempDir, InstallPaths, BackupArchiver, RollbackEngine) {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = InstallPaths::new(temp.path().join("dagr"))
            .expect("absolute root should be accepted")
            .with_scratch_dir(temp.path().join("scratch"));
        write(&paths.project_root, "VERSION", "1.0.0");
        write(&paths.project_root, "src/dagr.py", "print('v1')");
        let archiver = BackupArchiver::new(
            &paths,
            ["src", "VERSION"].into_iter().map(PathBuf::from).collect(),
        );
        let engine = RollbackEngine::new(&paths);
        (temp, paths, archiver, engine)
    }

    #[test]
    fn restore_brings_back_backed_up_files() {
        let (_temp, paths, archiver, engine) = setup();
        let backup = archiver
            .create(Some("b1"), &Version::new(1, 0, 0), None)
            .expect("backup should be created");
        write(&paths.project_root, "VERSION", "2.0.0");
        write(&paths.project_root, "src/dagr.py", "print('v2')");

        let report = engine.restore(&backup).expect("restore should succeed");

        assert_eq!(report.restored, 2);
        assert_eq!(report.version, Version::new(1, 0, 0));
        assert_eq!(
            std::fs::read_to_string(paths.project_root.join("src/dagr.py"))
                .expect("source should exist"),
            "print('v1')"
        );
        assert_eq!(
            std::fs::read_to_string(paths.project_root.join("VERSION"))
                .expect("marker should exist"),
            "1.0.0"
        );
        assert!(!paths.project_root.join("manifest.json").exists());
    }

    #[test]
    fn tampered_backup_is_refused_before_copying() {
        let (_temp, paths, archiver, engine) = setup();
        let backup = archiver
            .create(Some("b1"), &Version::new(1, 0, 0), None)
            .expect("backup should be created");
        std::fs::remove_file(backup.path.join("src/dagr.py")).expect("file should be removed");
        write(&backup.path, "extra.txt", "");
        write(&paths.project_root, "VERSION", "2.0.0");

        let result = engine.restore(&backup);

        match result {
            Err(RestoreError::ManifestMismatch {
                missing,
                unexpected,
                ..
            }) => {
                assert_eq!(missing, vec!["src/dagr.py".to_string()]);
                assert_eq!(unexpected, vec!["extra.txt".to_string()]);
            }
            other => panic!("expected manifest mismatch, got {other:?}"),
        }
        assert_eq!(
            std::fs::read_to_string(paths.project_root.join("VERSION"))
                .expect("marker should exist"),
            "2.0.0"
        );
    }

    #[test]
    fn backup_without_marker_writes_manifest_version() {
        let (_temp, paths, _archiver, engine) = setup();
        let archiver = BackupArchiver::new(&paths, vec![PathBuf::from("src")]);
        let backup = archiver
            .create(Some("src-only"), &Version::new(1, 0, 0), None)
            .expect("backup should be created");
        write(&paths.project_root, "VERSION", "2.0.0");

        engine.restore(&backup).expect("restore should succeed");

        assert_eq!(
            std::fs::read_to_string(paths.project_root.join("VERSION"))
                .expect("marker should exist"),
            "1.0.0"
        );
    }
}
