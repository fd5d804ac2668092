use std::time::Duration;

use log::debug;
use serde::Deserialize;
use thiserror::Error;

use crate::extract::ArchiveFormat;
use crate::version::{Version, VersionParseError};

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubAsset {
    pub name: String,
    pub browser_download_url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub digest: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GitHubRelease {
    pub tag_name: String,
    #[serde(default)]
    pub published_at: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub assets: Vec<GitHubAsset>,
}

/// An update candidate described by the release index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub remote_version: Version,
    pub download_url: Option<String>,
    pub published_at: Option<String>,
    pub notes: Option<String>,
    pub download_size: Option<u64>,
    pub download_sha256: Option<String>,
}

#[derive(Debug, Error)]
pub enum ReleaseError {
    #[error("failed to query release index: {0}")]
    Request(#[source] reqwest::Error),
    #[error("release index query timed out after {seconds}s")]
    Timeout { seconds: u64 },
    #[error("release index returned HTTP {status}{body_snippet}")]
    HttpStatus {
        status: reqwest::StatusCode,
        body_snippet: String,
    },
    #[error("failed to parse release index response: {0}")]
    Parse(#[source] reqwest::Error),
    #[error("release tag '{tag}' is not a valid version: {source}")]
    InvalidTag {
        tag: String,
        #[source]
        source: VersionParseError,
    },
}

impl Release {
    /// Map a release-index entry, picking the first asset whose name ends in
    /// a supported archive extension.
    ///
    /// # Errors
    /// Returns an error when the tag is not a valid version.
    pub fn from_github(release: GitHubRelease) -> Result<Self, ReleaseError> {
        let remote_version =
            Version::parse(&release.tag_name).map_err(|source| ReleaseError::InvalidTag {
                tag: release.tag_name.clone(),
                source,
            })?;

        let asset = release
            .assets
            .iter()
            .find(|asset| ArchiveFormat::from_file_name(&asset.name).is_some());
        if asset.is_none() {
            debug!("Release {} has no archive asset", release.tag_name);
        }

        Ok(Self {
            remote_version,
            download_url: asset.map(|asset| asset.browser_download_url.clone()),
            published_at: release.published_at,
            notes: release.body.filter(|body| !body.trim().is_empty()),
            download_size: asset.and_then(|asset| asset.size),
            download_sha256: asset
                .and_then(|asset| asset.digest.as_deref())
                .and_then(parse_sha256_digest),
        })
    }
}

/// Fetch the newest release from a GitHub-style `releases/latest` endpoint.
///
/// # Errors
/// Returns an error on connection failure, timeout, non-success status, or
/// an unparseable body.
pub async fn fetch_latest_release(
    client: &reqwest::Client,
    url: &str,
    timeout: Duration,
) -> Result<Release, ReleaseError> {
    let response = client
        .get(url)
        .header("User-Agent", "dagr-update")
        .header("Accept", "application/vnd.github+json")
        .timeout(timeout)
        .send()
        .await
        .map_err(|error| request_error(error, timeout))?;

    if !response.status().is_success() {
        let status = response.status();
        let body_snippet = response
            .text()
            .await
            .ok()
            .map(|body| response_snippet(&body, 160))
            .unwrap_or_default();
        return Err(ReleaseError::HttpStatus {
            status,
            body_snippet,
        });
    }

    let release: GitHubRelease = response.json().await.map_err(|error| {
        if error.is_timeout() {
            ReleaseError::Timeout {
                seconds: timeout.as_secs(),
            }
        } else {
            ReleaseError::Parse(error)
        }
    })?;

    Release::from_github(release)
}

fn request_error(error: reqwest::Error, timeout: Duration) -> ReleaseError {
    if error.is_timeout() {
        ReleaseError::Timeout {
            seconds: timeout.as_secs(),
        }
    } else {
        ReleaseError::Request(error)
    }
}

fn response_snippet(body: &str, max_chars: usize) -> String {
    let snippet: String = body.chars().take(max_chars).collect();
    if snippet.is_empty() {
        String::new()
    } else {
        format!(": {snippet}")
    }
}

fn parse_sha256_digest(digest: &str) -> Option<String> {
    let (algorithm, hash) = digest.split_once(':')?;
    if !algorithm.eq_ignore_ascii_case("sha256") {
        return None;
    }
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}
