//! Platform adapters for the Dagr updater.
//!
//! Everything here touches the host rather than the update pipeline itself:
//! - Installation layout (`InstallPaths`).
//! - Service start/stop (`ServiceController`, systemd implementation).
//! - Source-control revision lookup (`CommitProbe`, git implementation).

mod commit;
mod paths;
mod service;

pub use commit::{CommitProbe, GitCommitProbe, NoCommitProbe};
pub use paths::{InstallPaths, InstallPathsError};
pub use service::{NoopServiceController, ServiceController, ServiceError, SystemdService};
