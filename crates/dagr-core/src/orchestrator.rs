use std::sync::Arc;

use dagr_platform::{CommitProbe, InstallPaths, ServiceController};
use log::{error, info, warn};
use tokio_util::sync::CancellationToken;

use crate::backup::{Backup, BackupArchiver, BackupError};
use crate::config::{ConfigError, UpdateConfig};
use crate::error::UpdateError;
use crate::extract::extract;
use crate::fetch::ReleaseFetcher;
use crate::install::{Installer, PermissionPolicy};
use crate::lock::OperationLock;
use crate::progress::{ProgressReporter, RollbackStage, UpdateProgress, UpdateStage};
use crate::release::Release;
use crate::rollback::RollbackEngine;
use crate::validate::validate;
use crate::version::Version;
use crate::version_store::{CheckFailure, UpdateCheck, VersionStore};

/// Result of [`UpdateOrchestrator::perform_update`].
#[derive(Debug)]
pub struct UpdateOutcome {
    pub success: bool,
    pub error: Option<UpdateError>,
    /// `Done` on success, otherwise the step that failed.
    pub stage: UpdateStage,
    pub previous_version: Version,
    pub new_version: Option<Version>,
    /// Backup taken by this run, if any.
    pub backup: Option<String>,
}

impl UpdateOutcome {
    #[must_use]
    pub fn failed_at(&self) -> Option<UpdateStage> {
        (!self.success).then_some(self.stage)
    }
}

/// Result of [`UpdateOrchestrator::rollback_to_backup`].
#[derive(Debug)]
pub struct RollbackOutcome {
    pub success: bool,
    pub error: Option<UpdateError>,
    pub stage: RollbackStage,
    pub backup: String,
    pub version: Option<Version>,
}

struct UpdateRun<'a> {
    progress: &'a ProgressReporter,
    stage: UpdateStage,
    backup: Option<String>,
}

impl UpdateRun<'_> {
    fn enter(&mut self, stage: UpdateStage) {
        info!("Update: {stage}");
        self.stage = stage;
        self.progress.report(UpdateProgress::Stage(stage));
    }
}

struct RollbackRun<'a> {
    progress: &'a ProgressReporter,
    stage: RollbackStage,
}

impl RollbackRun<'_> {
    fn enter(&mut self, stage: RollbackStage) {
        info!("Rollback: {stage}");
        self.stage = stage;
        self.progress.report(UpdateProgress::Rollback(stage));
    }
}

/// Sequences fetch, extract, validate, backup, apply and restart into one
/// fail-fast operation, and owns rollback and the backup listing.
///
/// Only one update or rollback runs at a time per installation; the
/// exclusive lock lives in the configuration directory so it also guards
/// against other processes.
pub struct UpdateOrchestrator {
    paths: InstallPaths,
    config: UpdateConfig,
    client: reqwest::Client,
    version_store: VersionStore,
    service: Arc<dyn ServiceController>,
    commit_probe: Arc<dyn CommitProbe>,
    fetcher: ReleaseFetcher,
    archiver: BackupArchiver,
    installer: Installer,
    rollback: RollbackEngine,
    progress: ProgressReporter,
    cancel: CancellationToken,
}

impl UpdateOrchestrator {
    /// Wire every component for the installation at `paths`.
    ///
    /// # Errors
    /// Returns an error when the configuration does not validate.
    pub fn new(
        paths: InstallPaths,
        config: UpdateConfig,
        client: reqwest::Client,
        service: Arc<dyn ServiceController>,
        commit_probe: Arc<dyn CommitProbe>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let installer = Installer::new(
            config.exclusions()?,
            PermissionPolicy {
                executables: config.executable_files.clone(),
                owner: config.owner.clone(),
            },
        );
        let fetcher = ReleaseFetcher::new(
            client.clone(),
            paths.scratch_dir.clone(),
            InstallPaths::scratch_prefix(),
            config.download_timeout(),
        );
        let version_store =
            VersionStore::new(&paths, config.update_channel.clone(), Arc::clone(&commit_probe));
        let archiver = BackupArchiver::new(&paths, config.backup_paths.clone());
        let rollback = RollbackEngine::new(&paths);

        Ok(Self {
            paths,
            config,
            client,
            version_store,
            service,
            commit_probe,
            fetcher,
            archiver,
            installer,
            rollback,
            progress: ProgressReporter::disabled(),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn with_progress(mut self, progress: ProgressReporter) -> Self {
        self.progress = progress;
        self
    }

    #[must_use]
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    #[must_use]
    pub fn version_store(&self) -> &VersionStore {
        &self.version_store
    }

    /// Token that aborts an in-flight download when cancelled.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Query the configured release endpoint.
    ///
    /// # Errors
    /// Returns a [`CheckFailure`] when the endpoint cannot be reached or
    /// parsed.
    pub async fn check_for_updates(&self) -> Result<UpdateCheck, CheckFailure> {
        self.version_store
            .check_for_updates(
                &self.client,
                &self.config.update_url,
                self.config.check_timeout(),
            )
            .await
    }

    /// Existing backups, newest first.
    ///
    /// # Errors
    /// Returns an error when the backups directory cannot be read.
    pub fn list_backups(&self) -> Result<Vec<Backup>, BackupError> {
        self.archiver.list()
    }

    /// Remove scratch directories left by a crashed run.
    ///
    /// # Errors
    /// Returns [`UpdateError::Lock`] while another operation is running.
    pub fn cleanup_stale_scratch(&self) -> Result<usize, UpdateError> {
        let _lock = OperationLock::acquire(&self.paths.lock_file())?;
        Ok(self.fetcher.remove_stale_scratch())
    }

    /// Download and install the archive at `url`.
    pub async fn perform_update(&self, url: &str) -> UpdateOutcome {
        self.run_update(Some(url), None).await
    }

    /// Install `release`, verifying its digest when the index published one.
    pub async fn perform_release_update(&self, release: &Release) -> UpdateOutcome {
        self.run_update(
            release.download_url.as_deref(),
            release.download_sha256.as_deref(),
        )
        .await
    }

    async fn run_update(&self, url: Option<&str>, sha256: Option<&str>) -> UpdateOutcome {
        let previous_version = self.version_store.current();
        let mut run = UpdateRun {
            progress: &self.progress,
            stage: UpdateStage::Idle,
            backup: None,
        };

        let result = self.update_steps(url, sha256, &mut run).await;
        let stage = run.stage;
        let backup = run.backup;

        match result {
            Ok(new_version) => {
                self.progress.report(UpdateProgress::Stage(UpdateStage::Done));
                info!("Update completed successfully: {previous_version} -> {new_version}");
                UpdateOutcome {
                    success: true,
                    error: None,
                    stage: UpdateStage::Done,
                    previous_version,
                    new_version: Some(new_version),
                    backup,
                }
            }
            Err(error) => {
                self.progress.report(UpdateProgress::Stage(UpdateStage::Failed));
                error!("Update failed while {stage}: {error}");
                if error.installation_inconsistent() {
                    error!(
                        "Installation at {} may be partially updated",
                        self.paths.project_root.display()
                    );
                }
                UpdateOutcome {
                    success: false,
                    error: Some(error),
                    stage,
                    previous_version,
                    new_version: None,
                    backup,
                }
            }
        }
    }

    async fn update_steps(
        &self,
        url: Option<&str>,
        sha256: Option<&str>,
        run: &mut UpdateRun<'_>,
    ) -> Result<Version, UpdateError> {
        let _lock = OperationLock::acquire(&self.paths.lock_file())?;
        let url = url.ok_or(UpdateError::NoDownloadUrl)?;
        let current = self.version_store.refresh();

        run.enter(UpdateStage::Downloading);
        // Dropping the archive removes the scratch directory, extracted tree included.
        let archive = self
            .fetcher
            .download(url, sha256, &self.progress, &self.cancel)
            .await?;

        run.enter(UpdateStage::Extracting);
        let archive_path = archive.path().to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract(&archive_path)).await??;

        run.enter(UpdateStage::Validating);
        let critical_files = self.config.critical_files.clone();
        let validate_current = current.clone();
        let package = tokio::task::spawn_blocking(move || {
            validate(&extracted, &validate_current, &critical_files)
        })
        .await??;

        if self.config.backup_before_update {
            run.enter(UpdateStage::BackingUp);
            let git_commit = self.commit_probe.current_hash().await;
            let archiver = self.archiver.clone();
            let backup_version = current.clone();
            let backup = tokio::task::spawn_blocking(move || {
                archiver.create(None, &backup_version, git_commit)
            })
            .await??;
            run.backup = Some(backup.name);
        } else {
            info!("Backup before update disabled, skipping");
        }

        run.enter(UpdateStage::Stopping);
        self.stop_service().await;

        run.enter(UpdateStage::Applying);
        let installer = self.installer.clone();
        let install_root = self.paths.project_root.clone();
        let content_root = package.content_root.clone();
        let applied =
            tokio::task::spawn_blocking(move || installer.apply(&content_root, &install_root))
                .await?;
        if let Err(source) = applied {
            error!("Failed to apply update: {source}");
            let restored_from = self.restore_after_failed_apply(run.backup.as_deref()).await;
            let error = UpdateError::Apply {
                source,
                restored_from,
            };
            self.restart_if_consistent(&error).await;
            return Err(error);
        }

        if let Err(error) = self.version_store.set(&package.version).await {
            let error = UpdateError::from(error);
            self.restart_if_consistent(&error).await;
            return Err(error);
        }

        if self.config.restart_after_update {
            run.enter(UpdateStage::Starting);
            self.start_service().await;
        } else {
            info!("Restart after update disabled, leaving service stopped");
        }

        drop(archive);
        Ok(package.version)
    }

    async fn restore_after_failed_apply(&self, backup: Option<&str>) -> Option<String> {
        let Some(name) = backup else {
            warn!("No backup from this run to restore");
            return None;
        };
        warn!("Restoring backup '{name}' after failed apply");

        let archiver = self.archiver.clone();
        let engine = self.rollback.clone();
        let backup_name = name.to_string();
        let restored = tokio::task::spawn_blocking(move || {
            let backup = archiver.open(&backup_name)?;
            engine.restore(&backup).map_err(UpdateError::from)
        })
        .await
        .map_err(UpdateError::from)
        .and_then(std::convert::identity);

        match restored {
            Ok(report) => {
                let version = self.version_store.refresh();
                info!(
                    "Restored {} files from '{}', installation back at {version}",
                    report.restored, report.backup
                );
                Some(report.backup)
            }
            Err(error) => {
                error!("Automatic restore of '{name}' failed: {error}");
                None
            }
        }
    }

    /// Restore the installation from the backup called `name`.
    pub async fn rollback_to_backup(&self, name: &str) -> RollbackOutcome {
        let mut run = RollbackRun {
            progress: &self.progress,
            stage: RollbackStage::Idle,
        };

        let result = self.rollback_steps(name, &mut run).await;
        let stage = run.stage;

        match result {
            Ok(version) => {
                self.progress
                    .report(UpdateProgress::Rollback(RollbackStage::Done));
                info!("Rollback to '{name}' completed, installation at {version}");
                RollbackOutcome {
                    success: true,
                    error: None,
                    stage: RollbackStage::Done,
                    backup: name.to_string(),
                    version: Some(version),
                }
            }
            Err(error) => {
                self.progress
                    .report(UpdateProgress::Rollback(RollbackStage::Failed));
                error!("Rollback to '{name}' failed while {stage}: {error}");
                RollbackOutcome {
                    success: false,
                    error: Some(error),
                    stage,
                    backup: name.to_string(),
                    version: None,
                }
            }
        }
    }

    async fn rollback_steps(
        &self,
        name: &str,
        run: &mut RollbackRun<'_>,
    ) -> Result<Version, UpdateError> {
        let _lock = OperationLock::acquire(&self.paths.lock_file())?;
        let backup = self.archiver.open(name)?;

        run.enter(RollbackStage::Stopping);
        self.stop_service().await;

        run.enter(RollbackStage::Restoring);
        let engine = self.rollback.clone();
        let restored = tokio::task::spawn_blocking(move || engine.restore(&backup)).await?;
        let report = match restored {
            Ok(report) => report,
            Err(error) => {
                let error = UpdateError::from(error);
                self.restart_if_consistent(&error).await;
                return Err(error);
            }
        };

        run.enter(RollbackStage::VersionRefresh);
        let version = self.version_store.refresh();
        if version != report.version {
            warn!(
                "Restored VERSION says {version}, backup manifest says {}",
                report.version
            );
        }
        if let Err(error) = self.version_store.set(&version).await {
            let error = UpdateError::from(error);
            self.restart_if_consistent(&error).await;
            return Err(error);
        }

        if self.config.restart_after_update {
            run.enter(RollbackStage::Starting);
            self.start_service().await;
        }

        Ok(version)
    }

    /// Bring the service back after a failure that left the installation
    /// usable; a possibly half-written installation stays stopped.
    async fn restart_if_consistent(&self, error: &UpdateError) {
        if error.installation_inconsistent() {
            warn!("Leaving service stopped, installation may be inconsistent");
        } else if self.config.restart_after_update {
            self.start_service().await;
        }
    }

    async fn stop_service(&self) {
        if let Err(error) = self.service.stop().await {
            warn!("Could not stop service: {error}");
        }
    }

    async fn start_service(&self) {
        if let Err(error) = self.service.start().await {
            warn!("Could not start service: {error}");
        }
    }
}
