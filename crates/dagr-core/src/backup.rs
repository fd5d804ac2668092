use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use dagr_platform::InstallPaths;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::{copy_file, relative_files, slash_path, write_json};
use crate::version::Version;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("invalid backup name '{0}'")]
    InvalidName(String),
    #[error("backup '{0}' already exists")]
    AlreadyExists(String),
    #[error("backup '{0}' not found")]
    NotFound(String),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid backup manifest {}: {source}", .path.display())]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl BackupError {
    fn io(context: &'static str, source: std::io::Error) -> Self {
        Self::Io { context, source }
    }

    fn io_with_path(context: &'static str, path: &Path, source: &std::io::Error) -> Self {
        Self::io(
            context,
            std::io::Error::new(source.kind(), format!("{}: {source}", path.display())),
        )
    }
}

/// Metadata written next to every backup (`manifest.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub backup_date: DateTime<Utc>,
    pub version: Version,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

/// A named snapshot under the backups directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backup {
    pub name: String,
    pub path: PathBuf,
    pub manifest: BackupManifest,
}

impl Backup {
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.manifest.files.len()
    }

    /// Files currently present in the backup, excluding the manifest.
    ///
    /// # Errors
    /// Returns an error when the backup directory cannot be walked.
    pub fn actual_files(&self) -> Result<Vec<String>, BackupError> {
        let files = relative_files(&self.path)
            .map_err(|error| BackupError::io_with_path("failed to scan backup", &self.path, &error))?;
        Ok(files
            .iter()
            .filter(|file| file.as_os_str() != MANIFEST_FILE)
            .map(|file| slash_path(file))
            .collect())
    }
}

/// Creates and enumerates installation snapshots.
#[derive(Debug, Clone)]
pub struct BackupArchiver {
    project_root: PathBuf,
    backups_dir: PathBuf,
    backup_paths: Vec<PathBuf>,
}

impl BackupArchiver {
    #[must_use]
    pub fn new(paths: &InstallPaths, backup_paths: Vec<PathBuf>) -> Self {
        Self {
            project_root: paths.project_root.clone(),
            backups_dir: paths.backups_dir(),
            backup_paths,
        }
    }

    #[must_use]
    pub fn backups_dir(&self) -> &Path {
        &self.backups_dir
    }

    /// Snapshot the configured backup paths.
    ///
    /// Without a name, one is derived from the current UTC time. Any failure
    /// removes the partially written backup directory.
    ///
    /// # Errors
    /// Returns an error for invalid or already used names and for copy or
    /// manifest write failures.
    pub fn create(
        &self,
        name: Option<&str>,
        version: &Version,
        git_commit: Option<String>,
    ) -> Result<Backup, BackupError> {
        let backup_date = Utc::now();
        let name = match name {
            Some(name) => validate_name(name)?.to_string(),
            None => self.default_name(backup_date),
        };
        let backup_path = self.backups_dir.join(&name);

        std::fs::create_dir_all(&self.backups_dir).map_err(|error| {
            BackupError::io_with_path("failed to create backups directory", &self.backups_dir, &error)
        })?;
        match std::fs::create_dir(&backup_path) {
            Ok(()) => {}
            Err(error) if error.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(BackupError::AlreadyExists(name));
            }
            Err(error) => {
                return Err(BackupError::io_with_path(
                    "failed to create backup directory",
                    &backup_path,
                    &error,
                ));
            }
        }

        info!("Creating backup: {}", backup_path.display());
        match self.populate(&backup_path, backup_date, version, git_commit) {
            Ok(manifest) => {
                info!(
                    "Backup created successfully: {} ({} files)",
                    backup_path.display(),
                    manifest.files.len()
                );
                Ok(Backup {
                    name,
                    path: backup_path,
                    manifest,
                })
            }
            Err(error) => {
                error!("Failed to create backup: {error}");
                let _ = std::fs::remove_dir_all(&backup_path);
                Err(error)
            }
        }
    }

    /// Every readable backup, newest first.
    ///
    /// # Errors
    /// Returns an error only when the backups directory itself cannot be read.
    pub fn list(&self) -> Result<Vec<Backup>, BackupError> {
        let entries = match std::fs::read_dir(&self.backups_dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => {
                return Err(BackupError::io_with_path(
                    "failed to read backups directory",
                    &self.backups_dir,
                    &error,
                ));
            }
        };

        let mut backups = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            match read_manifest(&path) {
                Ok(manifest) => backups.push(Backup {
                    name,
                    path,
                    manifest,
                }),
                Err(error) => warn!("Could not read backup manifest for '{name}': {error}"),
            }
        }

        backups.sort_by(|a, b| {
            b.manifest
                .backup_date
                .cmp(&a.manifest.backup_date)
                .then_with(|| b.name.cmp(&a.name))
        });
        Ok(backups)
    }

    /// Look up one backup by name.
    ///
    /// # Errors
    /// Returns an error for invalid names, missing backups and unreadable
    /// manifests.
    pub fn open(&self, name: &str) -> Result<Backup, BackupError> {
        let name = validate_name(name)?;
        let path = self.backups_dir.join(name);
        if !path.is_dir() {
            return Err(BackupError::NotFound(name.to_string()));
        }
        let manifest = read_manifest(&path)?;
        Ok(Backup {
            name: name.to_string(),
            path,
            manifest,
        })
    }

    fn populate(
        &self,
        backup_path: &Path,
        backup_date: DateTime<Utc>,
        version: &Version,
        git_commit: Option<String>,
    ) -> Result<BackupManifest, BackupError> {
        for relative in &self.backup_paths {
            let source = self.project_root.join(relative);
            if source.is_file() {
                copy_file(&source, &backup_path.join(relative)).map_err(|error| {
                    BackupError::io_with_path("failed to copy file into backup", &source, &error)
                })?;
            } else if source.is_dir() {
                let files = relative_files(&source).map_err(|error| {
                    BackupError::io_with_path("failed to scan backup source", &source, &error)
                })?;
                for file in files {
                    let from = source.join(&file);
                    copy_file(&from, &backup_path.join(relative).join(&file)).map_err(|error| {
                        BackupError::io_with_path("failed to copy file into backup", &from, &error)
                    })?;
                }
            } else {
                debug!("Backup source {} does not exist, skipping", source.display());
            }
        }

        let files = relative_files(backup_path)
            .map_err(|error| BackupError::io_with_path("failed to scan backup", backup_path, &error))?
            .iter()
            .map(|file| slash_path(file))
            .collect();

        let manifest = BackupManifest {
            backup_date,
            version: version.clone(),
            git_commit,
            files,
        };
        let manifest_path = backup_path.join(MANIFEST_FILE);
        write_json(&manifest_path, &manifest).map_err(|error| {
            BackupError::io_with_path("failed to write backup manifest", &manifest_path, &error)
        })?;
        Ok(manifest)
    }

    fn default_name(&self, now: DateTime<Utc>) -> String {
        let base = now.format("backup_%Y%m%d_%H%M%S").to_string();
        if !self.backups_dir.join(&base).exists() {
            return base;
        }
        let mut n = 1_u32;
        loop {
            let candidate = format!("{base}_{n}");
            if !self.backups_dir.join(&candidate).exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

fn read_manifest(backup_path: &Path) -> Result<BackupManifest, BackupError> {
    let manifest_path = backup_path.join(MANIFEST_FILE);
    let content = std::fs::read_to_string(&manifest_path).map_err(|error| {
        BackupError::io_with_path("failed to read backup manifest", &manifest_path, &error)
    })?;
    serde_json::from_str(&content).map_err(|source| BackupError::Manifest {
        path: manifest_path,
        source,
    })
}

fn validate_name(name: &str) -> Result<&str, BackupError> {
    let valid = !name.is_empty()
        && !name.starts_with('.')
        && !name.contains(['/', '\\'])
        && name.chars().all(|ch| !ch.is_control());
    if valid {
        Ok(name)
    } else {
        Err(BackupError::InvalidName(name.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use dagr_platform::InstallPaths;

    use super::{BackupArchiver, BackupError, MANIFEST_FILE};
    use crate::version::Version;

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().expect("test path should have parent"))
            .expect("parent should be created");
        std::fs::write(path, contents).expect("file should be written");
    }

    fn installation() -> (tempfile::TempDir, InstallPaths, BackupArchiver) {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = InstallPaths::new(temp.path().join("dagr"))
            .expect("absolute root should be accepted")
            .with_scratch_dir(temp.path().join("scratch"));
        write(&paths.project_root, "VERSION", "1.0.0");
        write(&paths.project_root, "src/dagr.py", "print('v1')");
        write(&paths.project_root, "src/lib/util.py", "pass");
        write(&paths.project_root, "install/dagr.service", "[Unit]");
        write(&paths.project_root, "config/tokens.json", "{}");
        let archiver = BackupArchiver::new(
            &paths,
            ["src", "install", "VERSION"].into_iter().map(PathBuf::from).collect(),
        );
        (temp, paths, archiver)
    }

    #[test]
    fn create_copies_sources_and_writes_manifest() {
        let (_temp, _paths, archiver) = installation();

        let backup = archiver
            .create(Some("b1"), &Version::new(1, 0, 0), Some("abc1234".to_string()))
            .expect("backup should be created");

        assert_eq!(
            backup.manifest.files,
            vec![
                "VERSION".to_string(),
                "install/dagr.service".to_string(),
                "src/dagr.py".to_string(),
                "src/lib/util.py".to_string(),
            ]
        );
        assert_eq!(backup.manifest.version, Version::new(1, 0, 0));
        assert_eq!(backup.manifest.git_commit.as_deref(), Some("abc1234"));
        assert!(backup.path.join(MANIFEST_FILE).is_file());
        assert!(!backup.path.join("config/tokens.json").exists());
        assert_eq!(
            backup.actual_files().expect("backup should be scannable"),
            backup.manifest.files
        );
    }

    #[test]
    fn default_name_is_timestamped_and_unique() {
        let (_temp, _paths, archiver) = installation();

        let first = archiver
            .create(None, &Version::new(1, 0, 0), None)
            .expect("first backup should be created");
        let second = archiver
            .create(None, &Version::new(1, 0, 0), None)
            .expect("second backup should be created");

        assert!(first.name.starts_with("backup_"));
        assert_ne!(first.name, second.name);
    }

    #[test]
    fn existing_name_is_rejected_without_touching_backup() {
        let (_temp, _paths, archiver) = installation();
        archiver
            .create(Some("b1"), &Version::new(1, 0, 0), None)
            .expect("backup should be created");

        let result = archiver.create(Some("b1"), &Version::new(1, 0, 0), None);

        assert!(matches!(result, Err(BackupError::AlreadyExists(ref name)) if name == "b1"));
        assert!(archiver.open("b1").is_ok());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let (_temp, _paths, archiver) = installation();
        for name in ["", "../escape", "a/b", ".hidden"] {
            assert!(
                matches!(
                    archiver.create(Some(name), &Version::ZERO, None),
                    Err(BackupError::InvalidName(_))
                ),
                "{name:?} should be rejected"
            );
        }
    }

    #[cfg(unix)]
    #[test]
    fn failed_copy_removes_partial_backup() {
        use std::os::unix::fs::PermissionsExt;

        let (_temp, paths, archiver) = installation();
        let unreadable = paths.project_root.join("src/lib/util.py");
        std::fs::set_permissions(&unreadable, std::fs::Permissions::from_mode(0o000))
            .expect("permissions should be set");
        if std::fs::read(&unreadable).is_ok() {
            // Running as root: permission bits are not enforced.
            return;
        }

        let result = archiver.create(Some("partial"), &Version::new(1, 0, 0), None);

        assert!(matches!(result, Err(BackupError::Io { .. })));
        assert!(!archiver.backups_dir().join("partial").exists());
    }

    #[test]
    fn list_sorts_newest_first_and_skips_broken_entries() {
        let (_temp, _paths, archiver) = installation();
        archiver
            .create(Some("b1"), &Version::new(1, 0, 0), None)
            .expect("older backup should be created");
        archiver
            .create(Some("b2"), &Version::new(1, 0, 0), None)
            .expect("newer backup should be created");
        std::fs::create_dir_all(archiver.backups_dir().join("broken"))
            .expect("broken backup dir should be created");

        let names: Vec<String> = archiver
            .list()
            .expect("listing should succeed")
            .into_iter()
            .map(|backup| backup.name)
            .collect();

        assert_eq!(names, vec!["b2".to_string(), "b1".to_string()]);
    }

    #[test]
    fn list_without_backups_dir_is_empty() {
        let (_temp, _paths, archiver) = installation();
        assert!(archiver.list().expect("listing should succeed").is_empty());
    }

    #[test]
    fn open_missing_backup_is_not_found() {
        let (_temp, _paths, archiver) = installation();
        assert!(matches!(
            archiver.open("nope"),
            Err(BackupError::NotFound(_))
        ));
    }
}
