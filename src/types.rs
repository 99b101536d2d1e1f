//! Shared identifier types.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

/// Error type for parsing failures
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("value cannot be empty")]
    Empty,
    #[error("invalid character in value: {0:?}")]
    InvalidCharacter(char),
    #[error("value cannot start with '{0}'")]
    InvalidStart(char),
    #[error("value cannot contain '..'")]
    ParentTraversal,
    #[error("value cannot contain empty path segments")]
    EmptySegment,
}

fn reject_control(s: &str) -> Result<(), ParseError> {
    match s.chars().find(|c| c.is_control()) {
        Some(c) => Err(ParseError::InvalidCharacter(c)),
        None => Ok(()),
    }
}

/// Identifies a repository on a host.
///
/// The name is opaque to the poller, but it ends up both on git command lines
/// and as a relative path under a host root, so:
/// - Non-empty, with no empty `/`-separated segments
/// - Cannot start with `/` or `-`
/// - No `..`, backslashes or control characters
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoName(String);

impl RepoName {
    /// Returns the name as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Iterate over the `/`-separated segments of the name.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// Relative path for this repo with the final segment suffixed, e.g.
    /// `team/app` + `.git` becomes `team/app.git`.
    pub fn relative_path(&self, suffix: &str) -> PathBuf {
        let mut path = PathBuf::new();
        let mut segments = self.segments().peekable();
        while let Some(segment) = segments.next() {
            if segments.peek().is_some() {
                path.push(segment);
            } else {
                path.push(format!("{segment}{suffix}"));
            }
        }
        path
    }
}

impl FromStr for RepoName {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.starts_with('/') {
            return Err(ParseError::InvalidStart('/'));
        }

        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }

        if s.contains("..") {
            return Err(ParseError::ParentTraversal);
        }

        if s.contains('\\') {
            return Err(ParseError::InvalidCharacter('\\'));
        }

        reject_control(s)?;

        if s.split('/').any(str::is_empty) {
            return Err(ParseError::EmptySegment);
        }

        Ok(RepoName(s.to_string()))
    }
}

impl fmt::Display for RepoName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A revision specifier: branch name, symbolic ref or commit id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Revision(String);

impl Revision {
    /// Returns the revision as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Revision {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ParseError::Empty);
        }

        if s.starts_with('-') {
            return Err(ParseError::InvalidStart('-'));
        }

        if s.contains("..") {
            return Err(ParseError::ParentTraversal);
        }

        reject_control(s)?;

        Ok(Revision(s.to_string()))
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
