//! Git operations using a hybrid CLI + libgit2 approach.
//!
//! **CLI (sandboxed, time-bounded) for everything that talks to a remote or
//! writes history:** init, clone, add, commit, push, fetch.
//!
//! **libgit2 for local reads:** opening repositories, resolving revisions to
//! commits, reading the default branch.

use git2::Repository;
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;

use crate::config::{CommitIdentity, GitSettings};
use crate::exec::{self, CommandOutput, ExecError};

/// Errors returned by git operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// libgit2 reported an error.
    #[error("git operation failed: {0}")]
    Git(#[from] git2::Error),
    /// Repository path does not contain a git repo.
    #[error("repository not found at {0}")]
    NotFound(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    ParseError(String),
    /// A git command exited unsuccessfully.
    #[error("exec {command:?} failed: {status}\n{output}")]
    CommandFailed {
        command: String,
        status: String,
        output: String,
    },
    /// A git command could not be run or did not finish in time.
    #[error(transparent)]
    Exec(#[from] ExecError),
    /// Underlying IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl GitError {
    /// Captured process output, when the failure came from a command.
    pub fn output(&self) -> Option<&str> {
        match self {
            GitError::CommandFailed { output, .. } => Some(output),
            GitError::Exec(ExecError::TimedOut { output, .. }) => Some(output),
            _ => None,
        }
    }
}

/// Validate that a git ref (branch name, refspec side or commit SHA) does not
/// contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..` (path traversal / range syntax)
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
fn validate_git_ref(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.contains("..") {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain '..'",
            name
        )));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

/// Validate a URL or path handed to clone/push/fetch.
fn validate_url(value: &str, name: &str) -> Result<(), GitError> {
    if value.is_empty() {
        return Err(GitError::InvalidInput(format!("{} cannot be empty", name)));
    }
    if value.starts_with('-') {
        return Err(GitError::InvalidInput(format!(
            "{} cannot start with '-'",
            name
        )));
    }
    if value.bytes().any(|b| b == 0 || b < 0x20) {
        return Err(GitError::InvalidInput(format!(
            "{} cannot contain null or control characters",
            name
        )));
    }
    Ok(())
}

fn path_str<'a>(path: &'a Path, what: &str) -> Result<&'a str, GitError> {
    path.to_str()
        .ok_or_else(|| GitError::ParseError(format!("{} path is not valid UTF-8", what)))
}

/// Git CLI wrapper that never reads ambient user or system configuration.
#[derive(Debug, Clone, Default)]
pub struct GitCli {
    settings: GitSettings,
}

impl GitCli {
    pub fn new(settings: GitSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &GitSettings {
        &self.settings
    }

    /// Create a sandboxed Command.
    ///
    /// Applies:
    /// - `GIT_CONFIG_NOSYSTEM=1`, `HOME` / `XDG_CONFIG_HOME` pointed at a
    ///   nonexistent path - no system, global or user config
    /// - `GIT_TERMINAL_PROMPT=0`, `GIT_ASKPASS=true` - never prompt
    /// - `core.hooksPath=` - disable hooks execution
    /// - git's trace variables when tracing is enabled
    fn command(&self) -> Command {
        let home = &self.settings.sandbox_home;
        let mut cmd = Command::new(&self.settings.git_path);
        cmd.env("GIT_CONFIG_NOSYSTEM", "1");
        cmd.env("HOME", home);
        cmd.env("XDG_CONFIG_HOME", home);
        cmd.env("GIT_TERMINAL_PROMPT", "0");
        cmd.env("GIT_ASKPASS", "true");
        cmd.env("GIT_LFS_SKIP_SMUDGE", "1");
        for var in ["GIT_DIR", "GIT_WORK_TREE", "GIT_INDEX_FILE", "GIT_CONFIG_GLOBAL"] {
            cmd.env_remove(var);
        }
        if self.settings.trace {
            for var in [
                "GIT_TRACE",
                "GIT_CURL_VERBOSE",
                "GIT_TRACE_PACKET",
                "GIT_TRACE_PACK_ACCESS",
            ] {
                cmd.env(var, "1");
            }
        }
        cmd.args(["-c", "core.hooksPath="]);
        cmd.stdin(Stdio::null());
        cmd
    }

    /// Same as [`Self::command`] but running inside `dir`.
    fn command_in(&self, dir: &Path) -> Command {
        let mut cmd = self.command();
        cmd.current_dir(dir);
        cmd
    }

    /// Run a command, turning a non-zero exit into `CommandFailed`.
    fn run(&self, cmd: Command) -> Result<CommandOutput, GitError> {
        let output = exec::run(cmd, self.settings.command_timeout)?;
        if !output.success() {
            return Err(GitError::CommandFailed {
                status: output.status.to_string(),
                output: output.combined(),
                command: output.command,
            });
        }
        Ok(output)
    }

    /// `git --version`
    pub fn version(&self) -> Result<String, GitError> {
        let mut cmd = self.command();
        cmd.arg("--version");
        Ok(self.run(cmd)?.stdout.trim().to_string())
    }

    /// Initialize an empty bare repository whose `HEAD` points at `branch`.
    pub fn init_bare(&self, dest: &Path, branch: &str) -> Result<(), GitError> {
        validate_git_ref(branch, "branch")?;
        std::fs::create_dir_all(dest)?;
        let dest_str = path_str(dest, "destination")?;

        let mut cmd = self.command();
        cmd.args(["init", "--bare", "--quiet"])
            .arg(format!("--initial-branch={branch}"))
            .arg(dest_str);
        self.run(cmd)?;
        Ok(())
    }

    /// Clone `source` as a bare repository at `dest`.
    ///
    /// A partially created `dest` is removed on failure.
    pub fn clone_bare(&self, source: &str, dest: &Path) -> Result<(), GitError> {
        validate_url(source, "source")?;

        let dest_existed = dest.exists();
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let dest_str = path_str(dest, "destination")?;

        let mut cmd = self.command();
        cmd.args(["clone", "--bare", "--quiet", "--"])
            .arg(source)
            .arg(dest_str);

        if let Err(e) = self.run(cmd) {
            if !dest_existed {
                let _ = std::fs::remove_dir_all(dest);
            }
            return Err(e);
        }
        Ok(())
    }

    /// `git clone [args] <url> <name>` run inside `dir`.
    pub fn clone_worktree(&self, url: &str, dir: &Path, name: &str, args: &[String]) -> Result<(), GitError> {
        validate_url(url, "clone url")?;
        validate_git_ref(name, "clone directory")?;

        let mut cmd = self.command_in(dir);
        cmd.arg("clone").args(args).arg("--").arg(url).arg(name);
        self.run(cmd)?;
        Ok(())
    }

    /// `git remote add <name> <url>`
    pub fn remote_add(&self, repo: &Path, name: &str, url: &str) -> Result<(), GitError> {
        validate_git_ref(name, "remote")?;
        validate_url(url, "remote url")?;

        let mut cmd = self.command_in(repo);
        cmd.args(["remote", "add", name, url]);
        self.run(cmd)?;
        Ok(())
    }

    /// `git add -- <path>`
    pub fn add(&self, worktree: &Path, path: &str) -> Result<(), GitError> {
        validate_url(path, "path")?;

        let mut cmd = self.command_in(worktree);
        cmd.args(["add", "--", path]);
        self.run(cmd)?;
        Ok(())
    }

    /// Commit the index with a fixed author and committer.
    pub fn commit(
        &self,
        worktree: &Path,
        message: &str,
        identity: &CommitIdentity,
    ) -> Result<(), GitError> {
        let mut cmd = self.command_in(worktree);
        cmd.args(["commit", "--quiet", "-m", message])
            .arg("--author")
            .arg(identity.author())
            .arg("--date")
            .arg(&identity.date)
            .env("GIT_COMMITTER_NAME", &identity.name)
            .env("GIT_COMMITTER_EMAIL", &identity.email)
            .env("GIT_COMMITTER_DATE", &identity.date);
        self.run(cmd)?;
        Ok(())
    }

    /// `git push <remote> <refspec>`
    ///
    /// A refspec of the form `:branch` deletes `branch` on the remote.
    pub fn push(&self, worktree: &Path, remote: &str, refspec: &str) -> Result<(), GitError> {
        validate_url(remote, "remote")?;
        let (src, dst) = refspec.split_once(':').unwrap_or((refspec, ""));
        if !src.is_empty() {
            validate_git_ref(src, "refspec source")?;
        }
        if !dst.is_empty() {
            validate_git_ref(dst, "refspec destination")?;
        }

        let mut cmd = self.command_in(worktree);
        cmd.args(["push", remote, refspec]);
        self.run(cmd)?;
        Ok(())
    }

    /// Plain `git fetch` from the configured upstream.
    pub fn fetch(&self, worktree: &Path) -> Result<(), GitError> {
        let mut cmd = self.command_in(worktree);
        cmd.arg("fetch");
        self.run(cmd)?;
        Ok(())
    }

    /// Mirror every branch of `remote` into the bare repository at `repo`,
    /// pruning branches that were deleted upstream.
    pub fn fetch_heads(&self, repo: &Path, remote: &str) -> Result<(), GitError> {
        validate_git_ref(remote, "remote")?;
        let repo_str = path_str(repo, "repository")?;

        let mut cmd = self.command();
        cmd.arg("-C")
            .arg(repo_str)
            .args(["fetch", "--quiet", "--prune", remote, "+refs/heads/*:refs/heads/*"]);
        self.run(cmd)?;
        Ok(())
    }

    /// `git rev-parse --verify <rev>^{commit}`
    pub fn rev_parse(&self, repo: &Path, rev: &str) -> Result<String, GitError> {
        validate_git_ref(rev, "revision")?;

        let mut cmd = self.command_in(repo);
        cmd.args(["rev-parse", "--verify", "--quiet"])
            .arg(format!("{rev}^{{commit}}"));
        let output = self.run(cmd)?;
        let sha = output.stdout.trim().to_string();
        if sha.is_empty() {
            return Err(GitError::ParseError(format!(
                "rev-parse returned no commit for {}",
                rev
            )));
        }
        Ok(sha)
    }
}

/// Open an existing repository at the given path.
pub fn open_repository(path: &Path) -> Result<Repository, GitError> {
    let repo = Repository::open(path).map_err(|e| {
        if e.code() == git2::ErrorCode::NotFound {
            GitError::NotFound(path.display().to_string())
        } else {
            GitError::Git(e)
        }
    })?;
    Ok(repo)
}

/// Branch that `HEAD` points at, e.g. `"master"`.
///
/// Works on unborn branches too: only the symbolic target is read.
pub fn default_branch(repo: &Repository) -> Result<String, GitError> {
    let head = repo.find_reference("HEAD")?;
    let target = head
        .symbolic_target()
        .ok_or_else(|| GitError::ParseError("HEAD is not a symbolic reference".to_string()))?;

    target
        .strip_prefix("refs/heads/")
        .map(str::to_string)
        .ok_or_else(|| {
            GitError::ParseError(format!(
                "unexpected HEAD format: expected 'refs/heads/<branch>', got '{}'",
                target
            ))
        })
}

/// Check if a path contains a valid git repository.
pub fn repository_exists(path: &Path) -> bool {
    Repository::open(path).is_ok()
}
