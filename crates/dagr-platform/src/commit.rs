use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;

const GIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Best-effort lookup of the source-control revision of an installation.
#[async_trait]
pub trait CommitProbe: Send + Sync {
    /// Short commit hash, or `None` when it cannot be determined.
    async fn current_hash(&self) -> Option<String>;
}

/// Asks `git rev-parse --short HEAD` inside the installation root.
#[derive(Debug, Clone)]
pub struct GitCommitProbe {
    repo_dir: PathBuf,
}

impl GitCommitProbe {
    #[must_use]
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
        }
    }
}

#[async_trait]
impl CommitProbe for GitCommitProbe {
    async fn current_hash(&self) -> Option<String> {
        let git = match which::which("git") {
            Ok(git) => git,
            Err(error) => {
                debug!("git not available for commit lookup: {error}");
                return None;
            }
        };

        let output = tokio::process::Command::new(git)
            .args(["rev-parse", "--short", "HEAD"])
            .current_dir(&self.repo_dir)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(GIT_TIMEOUT, output).await {
            Ok(Ok(output)) => output,
            Ok(Err(error)) => {
                debug!("Could not run git: {error}");
                return None;
            }
            Err(_) => {
                debug!("git rev-parse timed out");
                return None;
            }
        };

        if !output.status.success() {
            debug!(
                "git rev-parse failed in {}: {}",
                self.repo_dir.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return None;
        }

        parse_hash(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Probe for installations without source control metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCommitProbe;

#[async_trait]
impl CommitProbe for NoCommitProbe {
    async fn current_hash(&self) -> Option<String> {
        None
    }
}

fn parse_hash(stdout: &str) -> Option<String> {
    let hash = stdout.trim();
    if hash.is_empty() || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        None
    } else {
        Some(hash.to_string())
    }
}
