//! Update and rollback pipeline for a Dagr installation.
//!
//! The pieces, leaf first:
//! - Version parsing, ordering and the persisted version record.
//! - Release index queries and archive downloads.
//! - Archive extraction and package validation.
//! - Backups, the installer, and restores.
//! - The orchestrator that sequences them under an exclusive lock.

mod backup;
mod config;
mod error;
mod extract;
mod fetch;
mod fsutil;
mod install;
mod lock;
mod orchestrator;
mod pattern;
mod progress;
mod release;
mod rollback;
mod validate;
mod version;
mod version_store;

/// Named snapshots and their manifests.
pub use backup::{Backup, BackupArchiver, BackupError, BackupManifest, MANIFEST_FILE};
/// Persisted update policy.
pub use config::{ConfigError, UpdateConfig};
/// Orchestrator-level error taxonomy.
pub use error::UpdateError;
/// Archive format detection and extraction.
pub use extract::{ArchiveFormat, EXTRACT_DIR_NAME, ExtractError, extract};
/// Streaming archive downloads.
pub use fetch::{DownloadedArchive, FetchError, ReleaseFetcher, archive_file_name};
/// Staged package installation.
pub use install::{ApplyError, ApplyReport, Installer, PermissionPolicy};
/// Cross-process operation lock.
pub use lock::{LockError, OperationLock};
/// Update and rollback workflows.
pub use orchestrator::{RollbackOutcome, UpdateOrchestrator, UpdateOutcome};
/// Exclusion globs.
pub use pattern::{ExclusionPattern, ExclusionSet, PatternError};
/// Workflow stages and progress events.
pub use progress::{ProgressReporter, RollbackStage, UpdateProgress, UpdateStage};
/// Release index model.
pub use release::{GitHubAsset, GitHubRelease, Release, ReleaseError, fetch_latest_release};
/// Restoring backups.
pub use rollback::{RestoreError, RestoreReport, RollbackEngine};
/// Package checks.
pub use validate::{VERSION_MARKER, ValidatedPackage, ValidationError, validate};
pub use version::{BumpKind, Version, VersionParseError};
pub use version_store::{CheckFailure, UpdateCheck, VersionInfo, VersionStore, VersionStoreError};
