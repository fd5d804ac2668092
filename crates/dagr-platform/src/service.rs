use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, info};
use thiserror::Error;

const SYSTEMCTL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("service manager not available: {0}")]
    Unavailable(String),
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("`systemctl {action} {unit}` exited with {status}: {stderr}")]
    CommandFailed {
        action: &'static str,
        unit: String,
        status: String,
        stderr: String,
    },
    #[error("`systemctl {action}` timed out after {seconds}s")]
    Timeout { action: &'static str, seconds: u64 },
}

/// Start/stop control over the service that runs out of the installation.
///
/// Callers treat failures as best-effort: they are logged, never fatal to an
/// update or rollback.
#[async_trait]
pub trait ServiceController: Send + Sync {
    async fn stop(&self) -> Result<(), ServiceError>;
    async fn start(&self) -> Result<(), ServiceError>;
}

/// Controls a systemd unit through `systemctl`.
#[derive(Debug, Clone)]
pub struct SystemdService {
    unit: String,
}

impl SystemdService {
    #[must_use]
    pub fn new(unit: impl Into<String>) -> Self {
        Self { unit: unit.into() }
    }

    #[must_use]
    pub fn unit(&self) -> &str {
        &self.unit
    }

    fn systemctl() -> Result<PathBuf, ServiceError> {
        which::which("systemctl").map_err(|error| ServiceError::Unavailable(error.to_string()))
    }

    async fn run(&self, action: &'static str) -> Result<(), ServiceError> {
        let systemctl = Self::systemctl()?;
        debug!("Running systemctl {action} {}", self.unit);

        let output = tokio::process::Command::new(systemctl)
            .args([action, self.unit.as_str()])
            .kill_on_drop(true)
            .output();
        let output = tokio::time::timeout(SYSTEMCTL_TIMEOUT, output)
            .await
            .map_err(|_| ServiceError::Timeout {
                action,
                seconds: SYSTEMCTL_TIMEOUT.as_secs(),
            })?
            .map_err(|source| ServiceError::Io {
                context: "failed to run systemctl",
                source,
            })?;

        if !output.status.success() {
            return Err(ServiceError::CommandFailed {
                action,
                unit: self.unit.clone(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        info!("systemctl {action} {} succeeded", self.unit);
        Ok(())
    }
}

#[async_trait]
impl ServiceController for SystemdService {
    async fn stop(&self) -> Result<(), ServiceError> {
        self.run("stop").await
    }

    async fn start(&self) -> Result<(), ServiceError> {
        self.run("start").await
    }
}

/// Controller for installations that are not run as a service.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopServiceController;

#[async_trait]
impl ServiceController for NoopServiceController {
    async fn stop(&self) -> Result<(), ServiceError> {
        Ok(())
    }

    async fn start(&self) -> Result<(), ServiceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{NoopServiceController, ServiceController, ServiceError, SystemdService};

    #[tokio::test]
    async fn noop_controller_always_succeeds() {
        let controller = NoopServiceController;
        assert!(controller.stop().await.is_ok());
        assert!(controller.start().await.is_ok());
    }

    #[test]
    fn systemd_service_keeps_unit_name() {
        assert_eq!(SystemdService::new("dagr").unit(), "dagr");
    }

    #[test]
    fn command_failure_display_names_unit_and_action() {
        let error = ServiceError::CommandFailed {
            action: "stop",
            unit: "dagr".to_string(),
            status: "exit status: 5".to_string(),
            stderr: "Unit dagr.service not loaded.".to_string(),
        };

        assert_eq!(
            error.to_string(),
            "`systemctl stop dagr` exited with exit status: 5: Unit dagr.service not loaded."
        );
    }
}
