//! Repository hosting with a lagging read side.
//!
//! [`LocalHost`] keeps two bare repositories per hosted repo under one root:
//!
//! ```text
//! <root>/origin/<name>.git   write side, what clients clone and push to
//! <root>/mirror/<name>.git   read side, only updated by a refresh
//! <root>/locks/<name>.lock   serializes refreshes of <name>
//! ```
//!
//! Reads go to the mirror, so a push is invisible until a refresh fetches it.
//! That is the replication lag the convergence poller exists to wait out.

mod lock;
mod refresh;

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::FixtureConfig;
use crate::git::{self, GitCli, GitError};
use crate::poll::{CommitSnapshot, ReadError, RefreshError, RemoteRead, RemoteRefresh};
use crate::types::{RepoName, Revision};

use refresh::{BackgroundRefresher, ORIGIN_REMOTE};

/// How long a refresh waits for another refresh of the same repo.
const REFRESH_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Error, Debug)]
pub enum HostError {
    #[error("repository {0} already exists")]
    AlreadyExists(String),
    #[error("unknown repository {0}")]
    UnknownRepo(String),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A repository as seen by fixture code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostedRepo {
    pub name: RepoName,
    /// URL (or path) to clone from and push to.
    pub clone_url: String,
    pub default_branch: String,
}

/// Creates and looks up repositories.
pub trait RepoHost: Send + Sync {
    /// Create an empty repository, or one seeded from `mirror_of`.
    fn create_repo(&self, name: &RepoName, mirror_of: Option<&str>) -> Result<HostedRepo, HostError>;

    fn get_repo(&self, name: &RepoName) -> Result<HostedRepo, HostError>;
}

/// Filesystem-backed host; see the module docs for the layout.
pub struct LocalHost {
    root: PathBuf,
    git: GitCli,
    default_branch: String,
    refresher: BackgroundRefresher,
}

impl LocalHost {
    /// Open (creating if needed) a host rooted at `root`.
    pub fn new(root: impl AsRef<Path>, config: &FixtureConfig) -> Result<Self, HostError> {
        std::fs::create_dir_all(root.as_ref())?;
        let root = std::fs::canonicalize(root.as_ref())?;
        let git = GitCli::new(config.git.clone());

        Ok(Self {
            root,
            refresher: BackgroundRefresher::new(git.clone(), REFRESH_LOCK_TIMEOUT),
            git,
            default_branch: config.default_branch.clone(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn origin_dir(&self, name: &RepoName) -> PathBuf {
        self.root.join("origin").join(name.relative_path(".git"))
    }

    pub fn mirror_dir(&self, name: &RepoName) -> PathBuf {
        self.root.join("mirror").join(name.relative_path(".git"))
    }

    fn lock_path(&self, name: &RepoName) -> PathBuf {
        self.root.join("locks").join(name.relative_path(".lock"))
    }

    /// Whether a background refresh of `name` is still running.
    pub fn refresh_in_flight(&self, name: &RepoName) -> bool {
        self.refresher.in_flight(name)
    }

    fn hosted(&self, name: &RepoName, origin: &Path) -> Result<HostedRepo, HostError> {
        let branch = git::default_branch(&git::open_repository(origin)?)?;
        Ok(HostedRepo {
            name: name.clone(),
            clone_url: origin.display().to_string(),
            default_branch: branch,
        })
    }

    fn create_dirs(
        &self,
        name: &RepoName,
        origin: &Path,
        mirror: &Path,
        mirror_of: Option<&str>,
    ) -> Result<HostedRepo, HostError> {
        match mirror_of {
            Some(source) => self.git.clone_bare(source, origin)?,
            None => self.git.init_bare(origin, &self.default_branch)?,
        }
        let hosted = self.hosted(name, origin)?;

        self.git.init_bare(mirror, &hosted.default_branch)?;
        self.git.remote_add(mirror, ORIGIN_REMOTE, &hosted.clone_url)?;
        Ok(hosted)
    }
}

impl RepoHost for LocalHost {
    fn create_repo(&self, name: &RepoName, mirror_of: Option<&str>) -> Result<HostedRepo, HostError> {
        let origin = self.origin_dir(name);
        let mirror = self.mirror_dir(name);
        if origin.exists() || mirror.exists() {
            return Err(HostError::AlreadyExists(name.to_string()));
        }

        match self.create_dirs(name, &origin, &mirror, mirror_of) {
            Ok(hosted) => {
                log::info!(
                    "created repo {} (default branch {}{})",
                    name,
                    hosted.default_branch,
                    mirror_of
                        .map(|s| format!(", mirror of {}", s))
                        .unwrap_or_default()
                );
                Ok(hosted)
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&origin);
                let _ = std::fs::remove_dir_all(&mirror);
                Err(e)
            }
        }
    }

    fn get_repo(&self, name: &RepoName) -> Result<HostedRepo, HostError> {
        let origin = self.origin_dir(name);
        if !git::repository_exists(&origin) {
            return Err(HostError::UnknownRepo(name.to_string()));
        }
        self.hosted(name, &origin)
    }
}

fn classify(e: git2::Error) -> ReadError {
    match e.code() {
        git2::ErrorCode::NotFound | git2::ErrorCode::UnbornBranch => ReadError::NotFound,
        _ => ReadError::Remote(e.message().to_string()),
    }
}

impl RemoteRead for LocalHost {
    fn get_commit(&self, repo: &RepoName, rev: &Revision) -> Result<CommitSnapshot, ReadError> {
        let repository = match git::open_repository(&self.mirror_dir(repo)) {
            Ok(r) => r,
            Err(GitError::NotFound(_)) => return Err(ReadError::NotFound),
            Err(e) => return Err(ReadError::Remote(e.to_string())),
        };

        let commit = repository
            .revparse_single(rev.as_str())
            .and_then(|object| object.peel_to_commit())
            .map_err(classify)?;
        let author = commit.author();

        Ok(CommitSnapshot {
            id: commit.id().to_string(),
            author_name: author.name().unwrap_or_default().to_string(),
            author_email: author.email().unwrap_or_default().to_string(),
            timestamp: author.when().seconds(),
            summary: commit.summary().unwrap_or_default().to_string(),
        })
    }
}

impl RemoteRefresh for LocalHost {
    fn trigger_refresh(&self, repo: &RepoName) -> Result<(), RefreshError> {
        let mirror = self.mirror_dir(repo);
        if !git::repository_exists(&mirror) {
            return Err(RefreshError::UnknownRepo(repo.to_string()));
        }
        self.refresher.trigger(repo, mirror, self.lock_path(repo))
    }
}
