use std::cmp::Ordering;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dagr_platform::{CommitProbe, InstallPaths};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fsutil::{write_atomic, write_json};
use crate::release::{Release, ReleaseError, fetch_latest_release};
use crate::version::Version;

/// Persisted record of the installed version (`version_info.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {
    pub version: Version,
    pub build_date: DateTime<Utc>,
    #[serde(default)]
    pub git_commit: Option<String>,
    #[serde(default = "default_channel")]
    pub update_channel: String,
    #[serde(default)]
    pub last_update_check: Option<DateTime<Utc>>,
    #[serde(default)]
    pub available_version: Option<Version>,
}

fn default_channel() -> String {
    "stable".to_string()
}

/// Result of a successful update check.
#[derive(Debug, Clone)]
pub struct UpdateCheck {
    pub current_version: Version,
    pub release: Release,
    pub update_available: bool,
    pub checked_at: DateTime<Utc>,
}

/// A failed update check; still reports the installed version.
#[derive(Debug, Error)]
#[error("update check failed (current version {current_version}): {source}")]
pub struct CheckFailure {
    pub current_version: Version,
    pub checked_at: DateTime<Utc>,
    #[source]
    pub source: ReleaseError,
}

#[derive(Debug, Error)]
pub enum VersionStoreError {
    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Default)]
struct StoreState {
    current: Option<Version>,
    info: Option<VersionInfo>,
}

/// Owner of the `VERSION` marker and `version_info.json`.
///
/// Both are read lazily on first use and cached for the lifetime of the
/// store; `refresh` re-reads the marker after the tree changed underneath.
pub struct VersionStore {
    version_file: PathBuf,
    info_file: PathBuf,
    update_channel: String,
    commit_probe: Arc<dyn CommitProbe>,
    state: Mutex<StoreState>,
}

impl VersionStore {
    #[must_use]
    pub fn new(
        paths: &InstallPaths,
        update_channel: impl Into<String>,
        commit_probe: Arc<dyn CommitProbe>,
    ) -> Self {
        Self {
            version_file: paths.version_file(),
            info_file: paths.version_info_file(),
            update_channel: update_channel.into(),
            commit_probe,
            state: Mutex::new(StoreState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Installed version; `0.0.0` when the marker is missing or unreadable.
    pub fn current(&self) -> Version {
        let mut state = self.lock();
        if let Some(current) = &state.current {
            return current.clone();
        }
        let current = self.read_marker();
        state.current = Some(current.clone());
        current
    }

    /// Re-read the marker from disk and align `version_info.json` with it.
    pub fn refresh(&self) -> Version {
        let current = self.read_marker();
        let mut state = self.lock();
        state.current = Some(current.clone());

        let mut info = self.cached_info(&mut state, &current);
        if info.version != current {
            info.version = current.clone();
            state.info = Some(info.clone());
            drop(state);
            if let Err(error) = write_json(&self.info_file, &info) {
                error!("Could not save version info: {error}");
            }
        }
        current
    }

    #[must_use]
    pub fn compare(a: &Version, b: &Version) -> Ordering {
        a.cmp(b)
    }

    pub fn is_newer_available(&self, candidate: &Version) -> bool {
        Self::compare(&self.current(), candidate) == Ordering::Less
    }

    /// Persisted version record.
    pub fn info(&self) -> VersionInfo {
        let current = self.current();
        let mut state = self.lock();
        self.cached_info(&mut state, &current)
    }

    /// Whether the last recorded check found a newer release.
    pub fn is_update_available(&self) -> bool {
        self.info()
            .available_version
            .is_some_and(|available| self.is_newer_available(&available))
    }

    /// Record `version` as installed: rewrite the marker, then the version
    /// record with a fresh build date and best-effort commit hash.
    ///
    /// # Errors
    /// Returns an error when either file cannot be written.
    pub async fn set(&self, version: &Version) -> Result<(), VersionStoreError> {
        write_atomic(&self.version_file, version.to_string().as_bytes()).map_err(|source| {
            VersionStoreError::Write {
                path: self.version_file.clone(),
                source,
            }
        })?;

        let git_commit = self.commit_probe.current_hash().await;

        let info = {
            let mut state = self.lock();
            state.current = Some(version.clone());
            let mut info = self.cached_info(&mut state, version);
            info.version = version.clone();
            info.build_date = Utc::now();
            info.git_commit = git_commit;
            state.info = Some(info.clone());
            info
        };

        write_json(&self.info_file, &info).map_err(|source| VersionStoreError::Write {
            path: self.info_file.clone(),
            source,
        })?;

        info!("Version updated to {version}");
        Ok(())
    }

    /// Query the release index and record the outcome.
    ///
    /// # Errors
    /// Returns a [`CheckFailure`] carrying the installed version when the
    /// index cannot be reached or parsed.
    pub async fn check_for_updates(
        &self,
        client: &reqwest::Client,
        url: &str,
        timeout: Duration,
    ) -> Result<UpdateCheck, CheckFailure> {
        info!("Checking for updates at {url}");
        let current_version = self.current();

        let release = match fetch_latest_release(client, url, timeout).await {
            Ok(release) => release,
            Err(source) => {
                error!("Update check failed: {source}");
                return Err(CheckFailure {
                    current_version,
                    checked_at: Utc::now(),
                    source,
                });
            }
        };

        let checked_at = Utc::now();
        let update_available = Self::compare(&current_version, &release.remote_version).is_lt();

        let info = {
            let mut state = self.lock();
            let mut info = self.cached_info(&mut state, &current_version);
            info.last_update_check = Some(checked_at);
            info.available_version = update_available.then(|| release.remote_version.clone());
            state.info = Some(info.clone());
            info
        };
        if let Err(error) = write_json(&self.info_file, &info) {
            error!("Could not save version info: {error}");
        }

        info!(
            "Update check complete. Current: {current_version}, Available: {}",
            release.remote_version
        );
        Ok(UpdateCheck {
            current_version,
            release,
            update_available,
            checked_at,
        })
    }

    fn read_marker(&self) -> Version {
        match std::fs::read_to_string(&self.version_file) {
            Ok(content) => Version::parse(&content).unwrap_or_else(|error| {
                error!(
                    "Invalid version marker {}: {error}",
                    self.version_file.display()
                );
                Version::ZERO
            }),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                warn!("VERSION file not found, defaulting to 0.0.0");
                Version::ZERO
            }
            Err(error) => {
                error!("Error reading version file: {error}");
                Version::ZERO
            }
        }
    }

    fn cached_info(&self, state: &mut StoreState, current: &Version) -> VersionInfo {
        if let Some(info) = &state.info {
            return info.clone();
        }
        let info = self.load_info().unwrap_or_else(|| VersionInfo {
            version: current.clone(),
            build_date: Utc::now(),
            git_commit: None,
            update_channel: self.update_channel.clone(),
            last_update_check: None,
            available_version: None,
        });
        state.info = Some(info.clone());
        info
    }

    fn load_info(&self) -> Option<VersionInfo> {
        let content = match std::fs::read_to_string(&self.info_file) {
            Ok(content) => content,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return None,
            Err(error) => {
                warn!("Could not load version info: {error}");
                return None;
            }
        };
        serde_json::from_str(&content)
            .map_err(|error| warn!("Could not parse version info: {error}"))
            .ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use dagr_platform::{CommitProbe, InstallPaths, NoCommitProbe};
    use mockito::Server;

    use super::{VersionInfo, VersionStore};
    use crate::release::ReleaseError;
    use crate::version::Version;

    struct FixedCommit;

    #[async_trait]
    impl CommitProbe for FixedCommit {
        async fn current_hash(&self) -> Option<String> {
            Some("abc1234".to_string())
        }
    }

    fn store_with(probe: Arc<dyn CommitProbe>) -> (tempfile::TempDir, InstallPaths, VersionStore) {
        let temp = tempfile::tempdir().expect("tempdir should be created");
        let paths = InstallPaths::new(temp.path().join("dagr"))
            .expect("absolute root should be accepted")
            .with_scratch_dir(temp.path().join("scratch"));
        paths.ensure_dirs().expect("dirs should be created");
        let store = VersionStore::new(&paths, "stable", probe);
        (temp, paths, store)
    }

    fn store() -> (tempfile::TempDir, InstallPaths, VersionStore) {
        store_with(Arc::new(NoCommitProbe))
    }

    fn v(input: &str) -> Version {
        Version::parse(input).expect("test version should parse")
    }

    #[test]
    fn missing_marker_reads_as_zero() {
        let (_temp, _paths, store) = store();
        assert_eq!(store.current(), Version::ZERO);
    }

    #[test]
    fn newer_available_follows_comparison() {
        let (_temp, paths, store) = store();
        std::fs::write(paths.version_file(), "1.2.3\n").expect("marker should be written");

        assert!(store.is_newer_available(&v("1.2.4")));
        assert!(!store.is_newer_available(&v("1.2.3")));
        assert!(!store.is_newer_available(&v("1.2.2")));
    }

    #[tokio::test]
    async fn set_round_trips_through_marker_and_info() {
        let (_temp, paths, store) = store_with(Arc::new(FixedCommit));

        store.set(&v("2.1.0-rc.1")).await.expect("set should succeed");

        assert_eq!(store.current(), v("2.1.0-rc.1"));
        assert_eq!(
            std::fs::read_to_string(paths.version_file()).expect("marker should exist"),
            "2.1.0-rc.1"
        );
        let info: VersionInfo = serde_json::from_str(
            &std::fs::read_to_string(paths.version_info_file()).expect("info should exist"),
        )
        .expect("info should parse");
        assert_eq!(info.version, v("2.1.0-rc.1"));
        assert_eq!(info.git_commit.as_deref(), Some("abc1234"));
        assert_eq!(info.update_channel, "stable");

        let reopened = VersionStore::new(&paths, "stable", Arc::new(NoCommitProbe));
        assert_eq!(reopened.current(), v("2.1.0-rc.1"));
    }

    #[test]
    fn refresh_picks_up_external_marker_change() {
        let (_temp, paths, store) = store();
        std::fs::write(paths.version_file(), "1.0.0").expect("marker should be written");
        assert_eq!(store.current(), v("1.0.0"));

        std::fs::write(paths.version_file(), "0.9.0").expect("marker should be rewritten");
        assert_eq!(store.current(), v("1.0.0"), "current is cached");
        assert_eq!(store.refresh(), v("0.9.0"));
        assert_eq!(store.info().version, v("0.9.0"));
    }

    #[tokio::test]
    async fn check_for_updates_records_available_version() {
        let (_temp, paths, store) = store();
        std::fs::write(paths.version_file(), "1.0.0").expect("marker should be written");

        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/latest")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"tag_name": "v1.1.0", "assets": [{"name": "dagr.tar.gz", "browser_download_url": "https://dl.example/dagr.tar.gz"}]}"#,
            )
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let check = store
            .check_for_updates(&client, &format!("{}/latest", server.url()), Duration::from_secs(5))
            .await
            .expect("check should succeed");

        mock.assert_async().await;
        assert!(check.update_available);
        assert_eq!(check.current_version, v("1.0.0"));
        let info = store.info();
        assert_eq!(info.available_version, Some(v("1.1.0")));
        assert_eq!(info.last_update_check, Some(check.checked_at));
        assert!(store.is_update_available());
    }

    #[tokio::test]
    async fn check_for_updates_failure_carries_current_version() {
        let (_temp, paths, store) = store();
        std::fs::write(paths.version_file(), "1.0.0").expect("marker should be written");

        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/latest")
            .with_status(503)
            .create_async()
            .await;

        let client = reqwest::Client::new();
        let failure = store
            .check_for_updates(&client, &format!("{}/latest", server.url()), Duration::from_secs(5))
            .await
            .expect_err("check should fail");

        assert_eq!(failure.current_version, v("1.0.0"));
        assert!(matches!(failure.source, ReleaseError::HttpStatus { .. }));
        assert!(store.info().last_update_check.is_none());
    }
}
