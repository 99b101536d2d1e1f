//! Fixture configuration.
//!
//! Everything the git runner and the orchestrator would otherwise pick up from
//! ambient process state is carried explicitly in [`FixtureConfig`].

use std::path::PathBuf;
use std::time::Duration;

/// Base time to wait for a pushed commit to show up on the read side.
const BASE_CONVERGENCE_WAIT: Duration = Duration::from_secs(9);

/// Pause between reads while waiting for convergence.
const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Per-command timeout for git invocations.
const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Wait multiplier applied when running under CI.
const CI_WAIT_FACTOR: u32 = 2;

/// Identity and timestamp stamped onto fixture commits so commit ids are
/// reproducible across runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
    pub date: String,
}

impl Default for CommitIdentity {
    fn default() -> Self {
        Self {
            name: "a".into(),
            email: "a@a.com".into(),
            date: "2006-01-02T15:04:05Z".into(),
        }
    }
}

impl CommitIdentity {
    /// `name <email>` as accepted by `git commit --author`.
    pub fn author(&self) -> String {
        format!("{} <{}>", self.name, self.email)
    }
}

/// Settings handed to the git runner for every command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitSettings {
    /// Git binary to execute.
    pub git_path: PathBuf,
    /// Upper bound for any single git invocation.
    pub command_timeout: Duration,
    /// Export git's trace variables so failures carry protocol detail.
    pub trace: bool,
    /// Stand-in for `HOME` / `XDG_CONFIG_HOME` so no user config is read.
    pub sandbox_home: PathBuf,
}

impl Default for GitSettings {
    fn default() -> Self {
        Self {
            git_path: PathBuf::from("git"),
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
            trace: false,
            sandbox_home: PathBuf::from("/doesnotexist"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixtureConfig {
    pub git: GitSettings,
    /// Convergence wait before the CI multiplier is applied.
    pub base_wait: Duration,
    /// Multiplier applied to the convergence wait (slower CI machines).
    pub ci_factor: u32,
    pub retry_interval: Duration,
    /// Branch new repositories start on and pushes target by default.
    pub default_branch: String,
    pub identity: CommitIdentity,
    pub commit_message: String,
}

impl Default for FixtureConfig {
    fn default() -> Self {
        Self {
            git: GitSettings::default(),
            base_wait: BASE_CONVERGENCE_WAIT,
            ci_factor: 1,
            retry_interval: DEFAULT_RETRY_INTERVAL,
            default_branch: "master".into(),
            identity: CommitIdentity::default(),
            commit_message: "hello".into(),
        }
    }
}

impl FixtureConfig {
    /// Build a config from defaults overridden by `VCSCONVERGE_*` variables.
    ///
    /// - `VCSCONVERGE_GIT`: git binary
    /// - `VCSCONVERGE_COMMAND_TIMEOUT_SECS`: per-command timeout
    /// - `VCSCONVERGE_GIT_TRACE`: enable git tracing
    /// - `VCSCONVERGE_CI_FACTOR`: wait multiplier, otherwise derived from `CI`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(git) = lookup("VCSCONVERGE_GIT").filter(|v| !v.trim().is_empty()) {
            config.git.git_path = PathBuf::from(git);
        }

        if let Some(raw) = lookup("VCSCONVERGE_COMMAND_TIMEOUT_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.git.command_timeout = Duration::from_secs(secs),
                _ => log::warn!(
                    "ignoring invalid VCSCONVERGE_COMMAND_TIMEOUT_SECS value: {}",
                    raw
                ),
            }
        }

        config.git.trace = lookup("VCSCONVERGE_GIT_TRACE")
            .map(|v| is_truthy(&v))
            .unwrap_or(false);

        config.ci_factor = match lookup("VCSCONVERGE_CI_FACTOR") {
            Some(raw) => match raw.trim().parse::<u32>() {
                Ok(factor) if factor > 0 => factor,
                _ => {
                    log::warn!("ignoring invalid VCSCONVERGE_CI_FACTOR value: {}", raw);
                    default_ci_factor(&lookup)
                }
            },
            None => default_ci_factor(&lookup),
        };

        config
    }

    /// How long to wait for a pushed commit to become visible.
    pub fn convergence_wait(&self) -> Duration {
        self.base_wait * self.ci_factor
    }
}

fn default_ci_factor(lookup: &impl Fn(&str) -> Option<String>) -> u32 {
    if lookup("CI").map(|v| is_truthy(&v)).unwrap_or(false) {
        CI_WAIT_FACTOR
    } else {
        1
    }
}

fn is_truthy(value: &str) -> bool {
    let value = value.trim().to_ascii_lowercase();
    value == "1" || value == "true" || value == "yes"
}
