use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use semver::Prerelease;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VersionParseError {
    #[error("version string is empty")]
    Empty,
    #[error("invalid version '{0}': expected MAJOR.MINOR.PATCH[-SUFFIX]")]
    InvalidFormat(String),
    #[error("invalid version suffix in '{input}': {reason}")]
    InvalidSuffix { input: String, reason: String },
}

/// Semantic version of an installation or release.
///
/// Ordering is numeric on `major.minor.patch`. On a tie, a suffixed version
/// sorts before the plain one (`1.0.0-rc.1 < 1.0.0`) and two suffixes compare
/// by SemVer pre-release precedence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
    pub suffix: Option<Prerelease>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BumpKind {
    Major,
    Minor,
    Patch,
}

impl Version {
    pub const ZERO: Version = Version::new(0, 0, 0);

    #[must_use]
    pub const fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
            suffix: None,
        }
    }

    /// Parse `MAJOR.MINOR.PATCH[-SUFFIX]`, tolerating a leading `v` and
    /// surrounding whitespace.
    ///
    /// # Errors
    /// Returns an error when the string does not have exactly three numeric
    /// components or the suffix is not a valid pre-release identifier list.
    pub fn parse(input: &str) -> Result<Self, VersionParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(VersionParseError::Empty);
        }
        let unprefixed = trimmed.strip_prefix('v').unwrap_or(trimmed);

        let (core, suffix) = match unprefixed.split_once('-') {
            Some((core, suffix)) => (core, Some(suffix)),
            None => (unprefixed, None),
        };

        let mut parts = core.split('.');
        let (Some(major), Some(minor), Some(patch), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(VersionParseError::InvalidFormat(trimmed.to_string()));
        };

        let number = |part: &str| {
            if part.is_empty() || !part.chars().all(|ch| ch.is_ascii_digit()) {
                return Err(VersionParseError::InvalidFormat(trimmed.to_string()));
            }
            part.parse::<u64>()
                .map_err(|_| VersionParseError::InvalidFormat(trimmed.to_string()))
        };

        let suffix = match suffix {
            None => None,
            Some("") => {
                return Err(VersionParseError::InvalidSuffix {
                    input: trimmed.to_string(),
                    reason: "suffix is empty".to_string(),
                });
            }
            Some(raw) => Some(Prerelease::new(raw).map_err(|error| {
                VersionParseError::InvalidSuffix {
                    input: trimmed.to_string(),
                    reason: error.to_string(),
                }
            })?),
        };

        Ok(Self {
            major: number(major)?,
            minor: number(minor)?,
            patch: number(patch)?,
            suffix,
        })
    }

    /// Next release version; the suffix is always dropped.
    #[must_use]
    pub fn bump(&self, kind: BumpKind) -> Self {
        match kind {
            BumpKind::Major => Self::new(self.major + 1, 0, 0),
            BumpKind::Minor => Self::new(self.major, self.minor + 1, 0),
            BumpKind::Patch => Self::new(self.major, self.minor, self.patch + 1),
        }
    }
}

impl Default for Version {
    fn default() -> Self {
        Self::ZERO
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.major, self.minor, self.patch)
            .cmp(&(other.major, other.minor, other.patch))
            .then_with(|| match (&self.suffix, &other.suffix) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(left), Some(right)) => left.cmp(right),
            })
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)?;
        if let Some(suffix) = &self.suffix {
            write!(f, "-{suffix}")?;
        }
        Ok(())
    }
}

impl FromStr for Version {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for Version {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Version {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl FromStr for BumpKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "major" => Ok(Self::Major),
            "minor" => Ok(Self::Minor),
            "patch" => Ok(Self::Patch),
            other => Err(format!("invalid bump kind '{other}'")),
        }
    }
}
