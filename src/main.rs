use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};

use vcsconverge::config::FixtureConfig;
use vcsconverge::fixture::{CloneOptions, FixtureOrchestrator, PushOptions};
use vcsconverge::git::GitCli;
use vcsconverge::host::{LocalHost, RepoHost};
use vcsconverge::poll::{PollOutcome, PollReport, PollRequest};
use vcsconverge::types::{RepoName, Revision};

#[derive(Parser)]
#[command(
    name = "vcsconverge",
    about = "Repository fixtures that wait out mirror replication lag"
)]
struct Cli {
    /// Host root directory (default: <cache dir>/vcsconverge)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a repository
    Create {
        repo: String,

        /// Seed the repository as a mirror of this URL or path
        #[arg(long)]
        mirror_of: Option<String>,
    },

    /// Push one commit and wait until it is readable
    Push {
        repo: String,

        /// File to commit as PATH=CONTENTS (repeatable, default myfile.txt=a)
        #[arg(long = "file", value_name = "PATH=CONTENTS")]
        files: Vec<String>,

        /// Branch to push to (default: the repository's default branch)
        #[arg(long)]
        branch: Option<String>,

        /// Also create and delete a throwaway branch
        #[arg(long)]
        delete_branch: bool,
    },

    /// Wait for a revision to become readable
    Poll {
        repo: String,

        /// Revision to wait for (default: the repository's default branch)
        #[arg(long)]
        rev: Option<String>,

        /// Maximum wait in milliseconds
        #[arg(long)]
        wait_ms: Option<u64>,

        /// Pause between reads in milliseconds
        #[arg(long)]
        interval_ms: Option<u64>,

        /// Print the outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Clone a repository into DIR/testrepo
    Clone {
        repo: String,

        dir: Option<PathBuf>,

        /// Run an empty fetch right after the clone
        #[arg(long)]
        empty_fetch: bool,

        /// Extra arguments for git clone (after --)
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Check dependencies
    Doctor,
}

type CmdResult = Result<(), Box<dyn std::error::Error>>;

fn main() {
    env_logger::init();

    let cli = Cli::parse();
    let config = FixtureConfig::from_env();

    let result = match cli.command {
        Commands::Doctor => cmd_doctor(&config, cli.root),
        command => run(command, cli.root, config),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

fn run(command: Commands, root: Option<PathBuf>, config: FixtureConfig) -> CmdResult {
    let fixture = Fixture::open(root, config)?;

    match command {
        Commands::Create { repo, mirror_of } => fixture.create(&repo, mirror_of.as_deref()),
        Commands::Push {
            repo,
            files,
            branch,
            delete_branch,
        } => fixture.push(&repo, &files, branch, delete_branch),
        Commands::Poll {
            repo,
            rev,
            wait_ms,
            interval_ms,
            json,
        } => fixture.poll(&repo, rev.as_deref(), wait_ms, interval_ms, json),
        Commands::Clone {
            repo,
            dir,
            empty_fetch,
            args,
        } => fixture.clone_repo(&repo, dir, empty_fetch, args),
        Commands::Doctor => cmd_doctor(
            fixture.orchestrator.config(),
            Some(fixture.host.root().to_path_buf()),
        ),
    }
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vcsconverge")
}

fn parse_repo(repo: &str) -> Result<RepoName, String> {
    repo.parse()
        .map_err(|e| format!("Invalid repo name {:?}: {}", repo, e))
}

fn parse_file(arg: &str) -> Result<(String, String), String> {
    arg.split_once('=')
        .map(|(path, contents)| (path.to_string(), contents.to_string()))
        .ok_or_else(|| format!("Invalid --file {:?}: expected PATH=CONTENTS", arg))
}

struct Fixture {
    host: Arc<LocalHost>,
    orchestrator: FixtureOrchestrator,
}

impl Fixture {
    fn open(root: Option<PathBuf>, config: FixtureConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let root = root.unwrap_or_else(default_root);
        let host = Arc::new(LocalHost::new(&root, &config)?);
        let orchestrator = FixtureOrchestrator::new(host.clone(), host.clone(), host.clone(), config);
        Ok(Self { host, orchestrator })
    }

    fn create(&self, repo: &str, mirror_of: Option<&str>) -> CmdResult {
        let name = parse_repo(repo)?;
        let hosted = self.orchestrator.create_repo(&name, mirror_of)?;

        println!("Created {}", hosted.name);
        println!("  Clone URL:      {}", hosted.clone_url);
        println!("  Default branch: {}", hosted.default_branch);
        Ok(())
    }

    fn push(&self, repo: &str, files: &[String], branch: Option<String>, delete_branch: bool) -> CmdResult {
        let name = parse_repo(repo)?;
        let hosted = self.host.get_repo(&name)?;

        let files = if files.is_empty() {
            None
        } else {
            Some(
                files
                    .iter()
                    .map(|f| parse_file(f))
                    .collect::<Result<BTreeMap<_, _>, _>>()?,
            )
        };
        let branch = branch.unwrap_or_else(|| hosted.default_branch.clone());
        let options = PushOptions {
            files,
            branch: Some(branch.clone()),
            push_url: None,
            delete_branch,
        };

        println!("Pushing to {} {}...", name, branch);
        let pushed = self.orchestrator.push_repo(&hosted.clone_url, &options)?;
        // Waiting on the branch would accept the mirror's previous tip.
        let rev: Revision = pushed.parse()?;
        let visible = self.orchestrator.wait_for_commit(&name, &rev)?;

        println!("Converged");
        println!("  Commit:  {}", visible.id);
        println!("  Summary: {}", visible.summary);
        Ok(())
    }

    fn poll(
        &self,
        repo: &str,
        rev: Option<&str>,
        wait_ms: Option<u64>,
        interval_ms: Option<u64>,
        json: bool,
    ) -> CmdResult {
        let name = parse_repo(repo)?;
        let rev: Revision = match rev {
            Some(rev) => rev.parse()?,
            None => self.host.get_repo(&name)?.default_branch.parse()?,
        };
        let config = self.orchestrator.config();
        let request = PollRequest::new(
            name,
            rev,
            wait_ms
                .map(Duration::from_millis)
                .unwrap_or_else(|| config.convergence_wait()),
            interval_ms
                .map(Duration::from_millis)
                .unwrap_or(config.retry_interval),
        )?;

        log::info!(
            "waiting up to {:?} for {} {} (retry every {:?})",
            request.max_wait(),
            request.repo(),
            request.rev(),
            request.retry_interval()
        );
        let start = Instant::now();
        let outcome = self.orchestrator.poller().poll(&request);
        let report = PollReport::new(&request, &outcome, start.elapsed());

        if json {
            println!("{}", serde_json::to_string_pretty(&report)?);
        } else {
            match &report.commit {
                Some(commit) => {
                    println!("Converged in {}ms", report.elapsed_ms);
                    println!("  Commit: {}", commit.id);
                    println!("  Author: {} <{}>", commit.author_name, commit.author_email);
                    println!("  Summary: {}", commit.summary);
                }
                None => println!(
                    "{} after {}ms: {}",
                    report.outcome,
                    report.elapsed_ms,
                    report.error.as_deref().unwrap_or("unknown error")
                ),
            }
        }

        match outcome {
            PollOutcome::Converged(_) => Ok(()),
            PollOutcome::Failed(_) => std::process::exit(1),
            PollOutcome::TimedOut { .. } => std::process::exit(2),
        }
    }

    fn clone_repo(&self, repo: &str, dir: Option<PathBuf>, empty_fetch: bool, args: Vec<String>) -> CmdResult {
        let name = parse_repo(repo)?;
        let hosted = self.host.get_repo(&name)?;
        let options = CloneOptions { args, empty_fetch };

        self.orchestrator
            .clone_repo(&hosted.clone_url, dir.as_deref(), &options)?;

        match dir {
            Some(dir) => println!("Cloned {} into {}", name, dir.join("testrepo").display()),
            None => println!("Cloned {} (temporary checkout removed)", name),
        }
        Ok(())
    }
}

fn cmd_doctor(config: &FixtureConfig, root: Option<PathBuf>) -> CmdResult {
    println!("vcsconverge System Check\n");

    let git = GitCli::new(config.git.clone());
    let version = git.version();
    println!(
        "[{}] git: {}",
        if version.is_ok() { "OK" } else { "FAIL" },
        match &version {
            Ok(v) => v.clone(),
            Err(e) => format!("not usable ({})", e),
        }
    );

    let root = root.unwrap_or_else(default_root);
    println!(
        "[{}] Host root: {}",
        if root.exists() { "OK" } else { "INFO" },
        root.display()
    );

    println!(
        "[INFO] Convergence wait: {:?} (ci factor {}), retry every {:?}",
        config.convergence_wait(),
        config.ci_factor,
        config.retry_interval
    );
    let settings = git.settings();
    println!(
        "[INFO] Git command timeout: {:?}, tracing {}, sandbox HOME {}",
        settings.command_timeout,
        if settings.trace { "on" } else { "off" },
        settings.sandbox_home.display()
    );

    if version.is_err() {
        std::process::exit(1);
    }

    Ok(())
}
