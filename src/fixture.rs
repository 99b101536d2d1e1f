//! Fixture orchestration: create repositories, push content, clone, and wait
//! for pushed commits to become visible on the read side.
//!
//! Every step is a single synchronous git invocation with no retry of its own;
//! the only waiting happens in the convergence poller.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::FixtureConfig;
use crate::git::{GitCli, GitError};
use crate::host::{HostError, HostedRepo, RepoHost};
use crate::poll::{
    CommitSnapshot, ConvergencePoller, PollError, PollOutcome, PollRequest, RemoteRead,
    RemoteRefresh, RequestError,
};
use crate::types::{ParseError, RepoName, Revision};

/// Branch used to exercise branch creation and deletion.
const THROWAWAY_BRANCH: &str = "tmpbranch";

/// Directory name clones are checked out under.
const CLONE_DIR_NAME: &str = "testrepo";

#[derive(Error, Debug)]
pub enum FixtureError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid name: {0}")]
    InvalidName(#[from] ParseError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Git(#[from] GitError),
    #[error(transparent)]
    Host(#[from] HostError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error(
        "repo {repo} revision {rev} not found on remote, even after triggering a VCS refresh and waiting {waited:?}"
    )]
    NotConverged {
        repo: String,
        rev: String,
        waited: Duration,
    },
}

impl FixtureError {
    /// Captured output of the git command that failed, if any.
    pub fn command_output(&self) -> Option<&str> {
        match self {
            FixtureError::Git(e) => e.output(),
            FixtureError::Host(HostError::Git(e)) => e.output(),
            _ => None,
        }
    }
}

/// How [`FixtureOrchestrator::push_repo`] builds and pushes its commit.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Path -> contents, all committed together. `None` pushes a single
    /// `myfile.txt`.
    pub files: Option<BTreeMap<String, String>>,
    /// Branch to push to; the configured default branch when `None`.
    pub branch: Option<String>,
    /// Push to a URL other than the clone URL.
    pub push_url: Option<String>,
    /// Also push to a throwaway branch and delete it again.
    pub delete_branch: bool,
}

/// How [`FixtureOrchestrator::clone_repo`] clones.
#[derive(Debug, Clone, Default)]
pub struct CloneOptions {
    /// Extra arguments placed before the URL.
    pub args: Vec<String>,
    /// Follow the clone with a `git fetch` that has nothing to negotiate.
    pub empty_fetch: bool,
}

/// A freshly created repo and the commit pushed to it.
#[derive(Debug, Clone)]
pub struct PushedRepo {
    pub repo: HostedRepo,
    pub commit: CommitSnapshot,
}

fn default_files() -> BTreeMap<String, String> {
    BTreeMap::from([("myfile.txt".to_string(), "a".to_string())])
}

pub struct FixtureOrchestrator {
    host: Arc<dyn RepoHost>,
    poller: ConvergencePoller,
    git: GitCli,
    config: FixtureConfig,
}

impl FixtureOrchestrator {
    pub fn new(
        host: Arc<dyn RepoHost>,
        reader: Arc<dyn RemoteRead>,
        refresher: Arc<dyn RemoteRefresh>,
        config: FixtureConfig,
    ) -> Self {
        Self {
            host,
            poller: ConvergencePoller::new(reader, refresher),
            git: GitCli::new(config.git.clone()),
            config,
        }
    }

    pub fn config(&self) -> &FixtureConfig {
        &self.config
    }

    pub fn poller(&self) -> &ConvergencePoller {
        &self.poller
    }

    /// Create a repository, optionally seeded as a mirror of `mirror_of`.
    pub fn create_repo(&self, name: &RepoName, mirror_of: Option<&str>) -> Result<HostedRepo, FixtureError> {
        Ok(self.host.create_repo(name, mirror_of)?)
    }

    /// Wait for `rev` of `repo` to be readable, using the configured wait and
    /// retry interval.
    pub fn wait_for_commit(&self, repo: &RepoName, rev: &Revision) -> Result<CommitSnapshot, FixtureError> {
        let request = PollRequest::new(
            repo.clone(),
            rev.clone(),
            self.config.convergence_wait(),
            self.config.retry_interval,
        )?;

        match self.poller.poll(&request) {
            PollOutcome::Converged(commit) => Ok(commit),
            PollOutcome::TimedOut { waited } => Err(FixtureError::NotConverged {
                repo: repo.to_string(),
                rev: rev.to_string(),
                waited,
            }),
            PollOutcome::Failed(e) => Err(e.into()),
        }
    }

    /// Look `name` up on the host and wait until its default branch is
    /// readable.
    pub fn ensure_repo_exists(&self, name: &RepoName) -> Result<CommitSnapshot, FixtureError> {
        let repo = self.host.get_repo(name)?;
        let rev: Revision = repo.default_branch.parse()?;
        self.wait_for_commit(name, &rev)
    }

    /// Create `name`, push `files` (or the default file) to its default branch
    /// and wait for that commit to be readable.
    pub fn create_and_push_repo(
        &self,
        name: &RepoName,
        files: Option<BTreeMap<String, String>>,
    ) -> Result<PushedRepo, FixtureError> {
        let repo = self.create_repo(name, None)?;
        let options = PushOptions {
            files,
            branch: Some(repo.default_branch.clone()),
            ..PushOptions::default()
        };
        self.push_repo(&repo.clone_url, &options)?;

        let rev: Revision = repo.default_branch.parse()?;
        let commit = self.wait_for_commit(name, &rev)?;
        Ok(PushedRepo { repo, commit })
    }

    /// Clone `clone_url`, commit the configured files in one commit and push
    /// it. Returns the id of the pushed commit.
    pub fn push_repo(&self, clone_url: &str, options: &PushOptions) -> Result<String, FixtureError> {
        if clone_url.is_empty() {
            return Err(FixtureError::InvalidInput(
                "push_repo can't be called with an empty clone url".to_string(),
            ));
        }

        let tmp = tempfile::tempdir()?;
        self.git.clone_worktree(clone_url, tmp.path(), CLONE_DIR_NAME, &[])?;
        let worktree = tmp.path().join(CLONE_DIR_NAME);

        let files = options.files.clone().unwrap_or_else(default_files);
        if files.is_empty() {
            return Err(FixtureError::InvalidInput("no files to commit".to_string()));
        }
        for (path, data) in &files {
            write_file(&worktree, path, data)?;
            self.git.add(&worktree, path)?;
        }
        self.git
            .commit(&worktree, &self.config.commit_message, &self.config.identity)?;
        let commit_id = self.git.rev_parse(&worktree, "HEAD")?;

        let remote = options.push_url.as_deref().unwrap_or("origin");
        let branch = options
            .branch
            .as_deref()
            .unwrap_or(&self.config.default_branch);
        self.git
            .push(&worktree, remote, &format!("HEAD:refs/heads/{branch}"))?;
        log::info!("pushed {} to {} ({})", commit_id, branch, clone_url);

        if options.delete_branch {
            self.git.push(
                &worktree,
                remote,
                &format!("HEAD:refs/heads/{THROWAWAY_BRANCH}"),
            )?;
            self.git
                .push(&worktree, remote, &format!(":refs/heads/{THROWAWAY_BRANCH}"))?;
            log::debug!("created and deleted {} on {}", THROWAWAY_BRANCH, clone_url);
        }

        Ok(commit_id)
    }

    /// Clone `clone_url` into `<dir>/testrepo` (a temporary dir when `dir` is
    /// `None`), optionally followed by an empty fetch.
    pub fn clone_repo(
        &self,
        clone_url: &str,
        dir: Option<&Path>,
        options: &CloneOptions,
    ) -> Result<(), FixtureError> {
        let tmp;
        let dir = match dir {
            Some(dir) => dir,
            None => {
                tmp = tempfile::tempdir()?;
                tmp.path()
            }
        };

        self.git.clone_worktree(clone_url, dir, CLONE_DIR_NAME, &options.args)?;
        if options.empty_fetch {
            self.git.fetch(&dir.join(CLONE_DIR_NAME))?;
        }
        Ok(())
    }
}

/// Write `data` to `path` inside `root`, creating parent directories.
fn write_file(root: &Path, path: &str, data: &str) -> Result<(), FixtureError> {
    let relative = Path::new(path);
    let escapes = relative.is_absolute()
        || relative
            .components()
            .any(|c| !matches!(c, std::path::Component::Normal(_)));
    if path.is_empty() || escapes {
        return Err(FixtureError::InvalidInput(format!(
            "file path {:?} must be relative and stay inside the repository",
            path
        )));
    }

    let full = root.join(relative);
    if let Some(parent) = full.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(full, data)?;
    Ok(())
}
