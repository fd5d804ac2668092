//! Glob matching for `excluded_files`.
//!
//! Patterns are `/`-separated and anchored at the package content root:
//! - `*` matches any run of characters within one path segment.
//! - `?` matches exactly one character within a segment.
//! - a segment that is exactly `**` matches zero or more whole segments.
//!
//! A pattern excludes a file when it matches the file's relative path or any
//! of its ancestor directories, so `config/backups/*` also covers
//! `config/backups/b1/src/app.py`.

use std::fmt;
use std::path::{Component, Path};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("exclusion pattern is empty")]
    Empty,
    #[error("exclusion pattern '{0}' must be relative")]
    Absolute(String),
    #[error("exclusion pattern '{0}' must not contain '..' segments")]
    ParentSegment(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    AnyDepth,
    Glob(Vec<char>),
}

/// One compiled exclusion glob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusionPattern {
    source: String,
    segments: Vec<Segment>,
}

impl ExclusionPattern {
    /// Compile a pattern.
    ///
    /// # Errors
    /// Returns an error for empty or absolute patterns and patterns that
    /// contain `..` segments.
    pub fn new(pattern: &str) -> Result<Self, PatternError> {
        let trimmed = pattern.trim();
        if trimmed.is_empty() {
            return Err(PatternError::Empty);
        }
        if trimmed.starts_with('/') || Path::new(trimmed).has_root() {
            return Err(PatternError::Absolute(trimmed.to_string()));
        }

        let mut segments = Vec::new();
        for raw in trimmed.split('/') {
            match raw {
                "" | "." => {}
                ".." => return Err(PatternError::ParentSegment(trimmed.to_string())),
                "**" => {
                    if segments.last() != Some(&Segment::AnyDepth) {
                        segments.push(Segment::AnyDepth);
                    }
                }
                glob => segments.push(Segment::Glob(glob.chars().collect())),
            }
        }
        if segments.is_empty() {
            return Err(PatternError::Empty);
        }

        Ok(Self {
            source: trimmed.to_string(),
            segments,
        })
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Whether this pattern excludes the file at `relative`.
    #[must_use]
    pub fn matches(&self, relative: &Path) -> bool {
        let parts = path_segments(relative);
        (1..=parts.len()).any(|len| match_segments(&self.segments, &parts[..len]))
    }
}

impl fmt::Display for ExclusionPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// The full set of exclusion patterns from configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExclusionSet {
    patterns: Vec<ExclusionPattern>,
}

impl ExclusionSet {
    /// Compile every pattern.
    ///
    /// # Errors
    /// Returns the first pattern error encountered.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, PatternError> {
        let patterns = patterns
            .iter()
            .map(|pattern| ExclusionPattern::new(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// First pattern that excludes `relative`, if any.
    #[must_use]
    pub fn matching(&self, relative: &Path) -> Option<&ExclusionPattern> {
        self.patterns
            .iter()
            .find(|pattern| pattern.matches(relative))
    }

    #[must_use]
    pub fn is_excluded(&self, relative: &Path) -> bool {
        self.matching(relative).is_some()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

fn path_segments(path: &Path) -> Vec<String> {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect()
}

fn match_segments(pattern: &[Segment], parts: &[String]) -> bool {
    match pattern.split_first() {
        None => parts.is_empty(),
        Some((Segment::AnyDepth, rest)) => {
            (0..=parts.len()).any(|skip| match_segments(rest, &parts[skip..]))
        }
        Some((Segment::Glob(glob), rest)) => match parts.split_first() {
            Some((part, remaining)) => {
                let chars: Vec<char> = part.chars().collect();
                match_glob(glob, &chars) && match_segments(rest, remaining)
            }
            None => false,
        },
    }
}

fn match_glob(glob: &[char], text: &[char]) -> bool {
    let (mut g, mut t) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while t < text.len() {
        match glob.get(g) {
            Some('*') => {
                backtrack = Some((g, t));
                g += 1;
            }
            Some('?') => {
                g += 1;
                t += 1;
            }
            Some(&ch) if ch == text[t] => {
                g += 1;
                t += 1;
            }
            _ => match backtrack {
                Some((star, consumed)) => {
                    g = star + 1;
                    t = consumed + 1;
                    backtrack = Some((star, consumed + 1));
                }
                None => return false,
            },
        }
    }

    glob[g..].iter().all(|&ch| ch == '*')
}
