use std::path::{Path, PathBuf};
use thiserror::Error;

const DEFAULT_PROJECT_DIR: &str = "/usr/local/dagr";
const SCRATCH_PREFIX: &str = "dagr_update_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InstallPathsError {
    #[error("Installation root must be an absolute path")]
    RelativeRoot,
}

/// Filesystem layout of one Dagr installation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallPaths {
    pub project_root: PathBuf,
    pub config_dir: PathBuf,
    pub scratch_dir: PathBuf,
}

impl InstallPaths {
    /// Build the layout for an installation rooted at `project_root`.
    ///
    /// Configuration lives in `<root>/config`; scratch space defaults to the
    /// user cache directory, falling back to the system temp directory.
    ///
    /// # Errors
    /// Returns an error when `project_root` is relative.
    pub fn new(project_root: impl Into<PathBuf>) -> Result<Self, InstallPathsError> {
        let project_root = project_root.into();
        if !project_root.is_absolute() {
            return Err(InstallPathsError::RelativeRoot);
        }
        let config_dir = project_root.join("config");
        Ok(Self {
            project_root,
            config_dir,
            scratch_dir: default_scratch_dir(),
        })
    }

    /// Build the layout from `PROJECT_DIR`, `DAGR_CONFIG_DIR` and
    /// `DAGR_SCRATCH_DIR`, using `/usr/local/dagr` when unset.
    ///
    /// # Errors
    /// Returns an error when the resulting root is relative.
    pub fn from_env() -> Result<Self, InstallPathsError> {
        let root = std::env::var_os("PROJECT_DIR")
            .map_or_else(|| PathBuf::from(DEFAULT_PROJECT_DIR), PathBuf::from);
        let mut paths = Self::new(root)?;
        if let Some(config_dir) = std::env::var_os("DAGR_CONFIG_DIR") {
            paths.config_dir = PathBuf::from(config_dir);
        }
        if let Some(scratch_dir) = std::env::var_os("DAGR_SCRATCH_DIR") {
            paths.scratch_dir = PathBuf::from(scratch_dir);
        }
        Ok(paths)
    }

    #[must_use]
    pub fn with_config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self
    }

    #[must_use]
    pub fn with_scratch_dir(mut self, scratch_dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = scratch_dir.into();
        self
    }

    #[must_use]
    pub fn version_file(&self) -> PathBuf {
        self.project_root.join("VERSION")
    }

    #[must_use]
    pub fn version_info_file(&self) -> PathBuf {
        self.config_dir.join("version_info.json")
    }

    #[must_use]
    pub fn update_config_file(&self) -> PathBuf {
        self.config_dir.join("update_config.json")
    }

    #[must_use]
    pub fn backups_dir(&self) -> PathBuf {
        self.config_dir.join("backups")
    }

    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.config_dir.join(".update.lock")
    }

    #[must_use]
    pub fn log_file(&self) -> PathBuf {
        self.config_dir.join("update.log")
    }

    /// Prefix of every scratch directory created under `scratch_dir`.
    #[must_use]
    pub fn scratch_prefix() -> &'static str {
        SCRATCH_PREFIX
    }

    /// Ensure the configuration, backup and scratch directories exist.
    ///
    /// # Errors
    /// Returns an error if any directory cannot be created.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.config_dir)?;
        std::fs::create_dir_all(self.backups_dir())?;
        std::fs::create_dir_all(&self.scratch_dir)?;
        Ok(())
    }

    /// Whether `path` lies inside the installation root.
    #[must_use]
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.project_root)
    }
}

fn default_scratch_dir() -> PathBuf {
    dirs::cache_dir().map_or_else(std::env::temp_dir, |dir| dir.join("dagr"))
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{InstallPaths, InstallPathsError};

    fn test_paths() -> (tempfile::TempDir, InstallPaths) {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = InstallPaths::new(temp.path().join("dagr"))
            .expect("absolute root should be accepted")
            .with_scratch_dir(temp.path().join("scratch"));
        (temp, paths)
    }

    #[test]
    fn file_paths_use_expected_filenames() {
        let (_temp, paths) = test_paths();

        assert!(paths.version_file().ends_with("dagr/VERSION"));
        assert!(
            paths
                .update_config_file()
                .ends_with(Path::new("config").join("update_config.json"))
        );
        assert!(
            paths
                .version_info_file()
                .ends_with(Path::new("config").join("version_info.json"))
        );
        assert!(paths.backups_dir().ends_with(Path::new("config").join("backups")));
    }

    #[test]
    fn relative_root_is_rejected() {
        assert_eq!(
            InstallPaths::new("relative/dagr"),
            Err(InstallPathsError::RelativeRoot)
        );
    }

    #[test]
    fn ensure_dirs_creates_all_directories() {
        let (_temp, paths) = test_paths();

        paths
            .ensure_dirs()
            .expect("ensure_dirs should create installation directories");

        assert!(paths.config_dir.is_dir());
        assert!(paths.backups_dir().is_dir());
        assert!(paths.scratch_dir.is_dir());
    }

    #[test]
    fn config_dir_override_moves_config_files() {
        let (temp, paths) = test_paths();
        let paths = paths.with_config_dir(temp.path().join("etc"));

        assert!(paths.update_config_file().starts_with(temp.path().join("etc")));
        assert!(paths.version_file().starts_with(&paths.project_root));
        assert!(paths.contains(&paths.version_file()));
        assert!(!paths.contains(&paths.update_config_file()));
    }
}
