//! Fire-and-forget mirror refreshes.
//!
//! A trigger starts a background thread that fetches the origin into the
//! mirror. Triggers that arrive while that thread is busy don't start another
//! thread; they mark the repo so the running thread fetches once more before
//! exiting. A push that lands mid-fetch is therefore never missed.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::HostError;
use super::lock::RepoLock;
use crate::git::GitCli;
use crate::poll::RefreshError;
use crate::types::RepoName;

/// Name of the remote a mirror fetches from.
pub(crate) const ORIGIN_REMOTE: &str = "origin";

/// Repo -> "fetch again when done" flag, present while a refresh runs.
type Pending = Arc<DashMap<RepoName, bool>>;

pub(crate) struct BackgroundRefresher {
    git: GitCli,
    pending: Pending,
    lock_timeout: Duration,
}

impl BackgroundRefresher {
    pub(crate) fn new(git: GitCli, lock_timeout: Duration) -> Self {
        Self {
            git,
            pending: Arc::new(DashMap::new()),
            lock_timeout,
        }
    }

    pub(crate) fn trigger(
        &self,
        repo: &RepoName,
        mirror: PathBuf,
        lock_path: PathBuf,
    ) -> Result<(), RefreshError> {
        match self.pending.entry(repo.clone()) {
            Entry::Occupied(mut entry) => {
                log::debug!("refresh of {} already running, queueing another pass", repo);
                *entry.get_mut() = true;
                return Ok(());
            }
            Entry::Vacant(entry) => {
                entry.insert(false);
            }
        }

        let job = RefreshJob {
            git: self.git.clone(),
            pending: Arc::clone(&self.pending),
            repo: repo.clone(),
            mirror,
            lock_path,
            lock_timeout: self.lock_timeout,
        };

        thread::Builder::new()
            .name("vcsconverge-refresh".to_string())
            .spawn(move || job.run())
            .map(|_| ())
            .map_err(|e| {
                self.pending.remove(repo);
                RefreshError::Remote(format!("failed to start refresh of {}: {}", repo, e))
            })
    }

    pub(crate) fn in_flight(&self, repo: &RepoName) -> bool {
        self.pending.contains_key(repo)
    }
}

struct RefreshJob {
    git: GitCli,
    pending: Pending,
    repo: RepoName,
    mirror: PathBuf,
    lock_path: PathBuf,
    lock_timeout: Duration,
}

impl RefreshJob {
    fn run(self) {
        loop {
            match self.fetch_once() {
                Ok(()) => log::debug!("refreshed mirror of {}", self.repo),
                Err(e) => log::warn!("background refresh failed for {}: {}", self.repo, e),
            }

            // Done unless someone asked for another pass meanwhile.
            if self
                .pending
                .remove_if(&self.repo, |_, again| !*again)
                .is_some()
            {
                break;
            }
            match self.pending.get_mut(&self.repo) {
                Some(mut again) => *again = false,
                None => break,
            }
        }
    }

    fn fetch_once(&self) -> Result<(), HostError> {
        let _lock = RepoLock::acquire(&self.lock_path, self.lock_timeout)?;
        self.git.fetch_heads(&self.mirror, ORIGIN_REMOTE)?;
        Ok(())
    }
}
