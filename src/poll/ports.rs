//! Read and refresh capabilities the poller is driven through.

use serde::Serialize;
use thiserror::Error;

use crate::types::{RepoName, Revision};

/// A commit as returned by the read side.
///
/// The poller only cares that one exists; the fields are for callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitSnapshot {
    pub id: String,
    pub author_name: String,
    pub author_email: String,
    /// Author time, seconds since the unix epoch.
    pub timestamp: i64,
    pub summary: String,
}

/// Classification of a failed read.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReadError {
    /// The commit is not (yet) visible. Retryable.
    #[error("commit not found")]
    NotFound,
    /// Anything else. Never retried.
    #[error("{0}")]
    Remote(String),
}

/// Failure to request a resynchronization.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RefreshError {
    #[error("unknown repository {0}")]
    UnknownRepo(String),
    #[error("{0}")]
    Remote(String),
}

/// The read path: look a revision up on the (lagging) read side.
///
/// Implementations must report an absent commit as [`ReadError::NotFound`] and
/// nothing else as such; retry decisions depend on it.
pub trait RemoteRead: Send + Sync {
    fn get_commit(&self, repo: &RepoName, rev: &Revision) -> Result<CommitSnapshot, ReadError>;
}

/// Ask the read side to resynchronize a repository.
///
/// Returns once the request is accepted, not when replication finishes.
/// Triggering repeatedly or concurrently must be harmless.
pub trait RemoteRefresh: Send + Sync {
    fn trigger_refresh(&self, repo: &RepoName) -> Result<(), RefreshError>;
}
