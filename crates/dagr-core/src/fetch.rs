use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{error, info, warn};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

use crate::extract::ArchiveFormat;
use crate::progress::{ProgressReporter, UpdateProgress};

const DEFAULT_ARCHIVE_NAME: &str = "update.tar.gz";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("download request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("download from {url} failed with HTTP {status}")]
    Status {
        url: String,
        status: reqwest::StatusCode,
    },
    #[error("download stream error: {0}")]
    Stream(#[source] reqwest::Error),
    #[error("download timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("download cancelled")]
    Cancelled,
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

impl FetchError {
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

/// A downloaded archive inside its private scratch directory.
///
/// Dropping it removes the whole scratch directory, including anything
/// extracted next to the archive.
#[derive(Debug)]
pub struct DownloadedArchive {
    dir: TempDir,
    path: PathBuf,
    bytes: u64,
}

impl DownloadedArchive {
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        self.dir.path()
    }

    #[must_use]
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

/// Streams release archives into fresh scratch directories.
#[derive(Debug, Clone)]
pub struct ReleaseFetcher {
    client: reqwest::Client,
    scratch_root: PathBuf,
    scratch_prefix: String,
    timeout: Duration,
}

impl ReleaseFetcher {
    #[must_use]
    pub fn new(
        client: reqwest::Client,
        scratch_root: impl Into<PathBuf>,
        scratch_prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            scratch_root: scratch_root.into(),
            scratch_prefix: scratch_prefix.into(),
            timeout,
        }
    }

    /// Download `url` into a new scratch directory.
    ///
    /// When `expected_sha256` is given the archive must match it. The whole
    /// transfer is bounded by the fetcher's timeout and aborts as soon as
    /// `cancel` fires. On any error the scratch directory is removed before
    /// the error is returned.
    ///
    /// # Errors
    /// Returns an error on connection failure, non-success status, stream
    /// interruption, timeout, cancellation, checksum mismatch, or local I/O
    /// failure.
    pub async fn download(
        &self,
        url: &str,
        expected_sha256: Option<&str>,
        progress: &ProgressReporter,
        cancel: &CancellationToken,
    ) -> Result<DownloadedArchive, FetchError> {
        info!("Downloading update from {url}");

        std::fs::create_dir_all(&self.scratch_root).map_err(|error| {
            FetchError::io_with_path("failed to create scratch root", &self.scratch_root, &error)
        })?;
        let dir = tempfile::Builder::new()
            .prefix(&self.scratch_prefix)
            .tempdir_in(&self.scratch_root)
            .map_err(|error| FetchError::io("failed to create temp directory", error))?;

        let file_name = archive_file_name(url);
        let path = dir.path().join(&file_name);

        let transfer = tokio::time::timeout(self.timeout, self.stream_to_file(url, &path, progress));
        let streamed = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(FetchError::Cancelled),
            result = transfer => result.unwrap_or_else(|_| Err(FetchError::Timeout {
                seconds: self.timeout.as_secs(),
            })),
        };

        let (bytes, actual) = match streamed {
            Ok(streamed) => streamed,
            Err(error) => {
                error!("Failed to download update: {error}");
                return Err(error);
            }
        };

        if let Some(expected) = expected_sha256 {
            if !actual.eq_ignore_ascii_case(expected.trim()) {
                error!("Checksum mismatch for {file_name}, refusing update");
                return Err(FetchError::ChecksumMismatch {
                    file: file_name,
                    expected: expected.trim().to_ascii_lowercase(),
                    actual,
                });
            }
            info!("Update checksum verified for {file_name}");
        }

        info!("Download completed: {} ({bytes} bytes)", path.display());
        Ok(DownloadedArchive { dir, path, bytes })
    }

    /// Write the response body to `dest`, hashing it on the way through.
    /// Returns the byte count and the lowercase hex SHA-256 of the body.
    async fn stream_to_file(
        &self,
        url: &str,
        dest: &Path,
        progress: &ProgressReporter,
    ) -> Result<(u64, String), FetchError> {
        use futures_util::StreamExt;

        let response = self
            .client
            .get(url)
            .header("User-Agent", "dagr-update")
            .send()
            .await
            .map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let total = response.content_length();
        let mut downloaded: u64 = 0;
        let mut digest = Sha256::new();

        let mut file = tokio::fs::File::create(dest).await.map_err(|error| {
            FetchError::io_with_path("failed to create download file", dest, &error)
        })?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(FetchError::Stream)?;
            digest.update(&chunk);
            file.write_all(&chunk).await.map_err(|error| {
                FetchError::io_with_path("failed to write download data", dest, &error)
            })?;
            downloaded += chunk.len() as u64;
            progress.report(UpdateProgress::Downloading { downloaded, total });
        }

        file.flush().await.map_err(|error| {
            FetchError::io_with_path("failed to flush download file", dest, &error)
        })?;

        Ok((downloaded, format!("{:x}", digest.finalize())))
    }
}

/// Archive file name for `url`: its last path segment when that has a
/// supported archive extension, `update.tar.gz` otherwise.
#[must_use]
pub fn archive_file_name(url: &str) -> String {
    let without_query = url.split(['?', '#']).next().unwrap_or(url);
    let raw = without_query.rsplit('/').next().unwrap_or_default();
    Path::new(raw)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && !name.contains(".."))
        .filter(|name| ArchiveFormat::from_file_name(name).is_some())
        .map_or_else(|| DEFAULT_ARCHIVE_NAME.to_string(), str::to_string)
}

impl ReleaseFetcher {
    /// Remove scratch directories left behind by an interrupted run.
    ///
    /// Returns how many were removed. Must only be called while no download
    /// is in flight against the same scratch root.
    pub fn remove_stale_scratch(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.scratch_root) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let name = entry.file_name();
            if !name.to_string_lossy().starts_with(&self.scratch_prefix) || !entry.path().is_dir() {
                continue;
            }
            match std::fs::remove_dir_all(entry.path()) {
                Ok(()) => {
                    info!("Removed stale scratch directory {}", entry.path().display());
                    removed += 1;
                }
                Err(error) => warn!(
                    "Could not remove stale scratch directory {}: {error}",
                    entry.path().display()
                ),
            }
        }
        removed
    }
}
