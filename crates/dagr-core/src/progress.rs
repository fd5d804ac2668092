use std::fmt;

use tokio::sync::mpsc;

/// Steps of the update workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Idle,
    Downloading,
    Extracting,
    Validating,
    BackingUp,
    Stopping,
    Applying,
    Starting,
    Done,
    Failed,
}

/// Steps of the rollback workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackStage {
    Idle,
    Stopping,
    Restoring,
    VersionRefresh,
    Starting,
    Done,
    Failed,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Downloading => "downloading",
            Self::Extracting => "extracting",
            Self::Validating => "validating",
            Self::BackingUp => "backing up",
            Self::Stopping => "stopping service",
            Self::Applying => "applying",
            Self::Starting => "starting service",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl fmt::Display for RollbackStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "idle",
            Self::Stopping => "stopping service",
            Self::Restoring => "restoring",
            Self::VersionRefresh => "refreshing version",
            Self::Starting => "starting service",
            Self::Done => "done",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateProgress {
    Stage(UpdateStage),
    Downloading { downloaded: u64, total: Option<u64> },
    Rollback(RollbackStage),
}

/// Optional progress channel.
///
/// Reports never wait: a full or closed channel drops the event, so a slow
/// observer cannot stall an update.
#[derive(Debug, Clone, Default)]
pub struct ProgressReporter {
    sender: Option<mpsc::Sender<UpdateProgress>>,
}

impl ProgressReporter {
    #[must_use]
    pub fn new(sender: mpsc::Sender<UpdateProgress>) -> Self {
        Self {
            sender: Some(sender),
        }
    }

    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn report(&self, progress: UpdateProgress) {
        if let Some(sender) = &self.sender {
            let _ = sender.try_send(progress);
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::{ProgressReporter, UpdateProgress, UpdateStage};

    #[test]
    fn full_channel_drops_events_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new(tx);

        reporter.report(UpdateProgress::Stage(UpdateStage::Downloading));
        reporter.report(UpdateProgress::Stage(UpdateStage::Extracting));

        assert_eq!(
            rx.try_recv().ok(),
            Some(UpdateProgress::Stage(UpdateStage::Downloading))
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disabled_reporter_is_a_no_op() {
        ProgressReporter::disabled().report(UpdateProgress::Stage(UpdateStage::Done));
    }

    #[test]
    fn stages_render_human_readable_names() {
        assert_eq!(UpdateStage::BackingUp.to_string(), "backing up");
        assert_eq!(
            super::RollbackStage::VersionRefresh.to_string(),
            "refreshing version"
        );
    }
}
