use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use vcsconverge::config::FixtureConfig;
use vcsconverge::fixture::{CloneOptions, FixtureError, FixtureOrchestrator, PushOptions};
use vcsconverge::git::{self, GitCli};
use vcsconverge::host::{LocalHost, RepoHost};
use vcsconverge::poll::{ReadError, RemoteRead};
use vcsconverge::types::{RepoName, Revision};

struct Setup {
    temp_dir: TempDir,
    host: Arc<LocalHost>,
    fixture: FixtureOrchestrator,
}

impl Setup {
    fn new() -> Self {
        Self::with_wait(Duration::from_secs(20))
    }

    fn with_wait(base_wait: Duration) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = FixtureConfig {
            base_wait,
            retry_interval: Duration::from_millis(50),
            ..FixtureConfig::default()
        };
        let host = Arc::new(LocalHost::new(temp_dir.path().join("host"), &config).unwrap());
        let fixture = FixtureOrchestrator::new(host.clone(), host.clone(), host.clone(), config);
        Self {
            temp_dir,
            host,
            fixture,
        }
    }

    fn origin_head(&self, repo: &RepoName, rev: &str) -> String {
        GitCli::default()
            .rev_parse(&self.host.origin_dir(repo), rev)
            .expect("rev-parse on origin failed")
    }
}

fn name(s: &str) -> RepoName {
    s.parse().unwrap()
}

fn rev(s: &str) -> Revision {
    s.parse().unwrap()
}

#[test]
fn create_and_push_converges_on_the_pushed_commit() {
    let setup = Setup::new();
    let repo = name("example.com/team/app");

    let pushed = setup
        .fixture
        .create_and_push_repo(&repo, None)
        .expect("create and push failed");

    assert_eq!(pushed.repo.default_branch, "master");
    assert_eq!(pushed.commit.id, setup.origin_head(&repo, "master"));
    assert_eq!(pushed.commit.author_name, "a");
    assert_eq!(pushed.commit.author_email, "a@a.com");
    assert_eq!(pushed.commit.timestamp, 1136214245);
    assert_eq!(pushed.commit.summary, "hello");
}

#[test]
fn pushed_files_are_committed_together() {
    let setup = Setup::new();
    let repo = name("files");
    let files = BTreeMap::from([
        ("README.md".to_string(), "# files\n".to_string()),
        ("src/lib/mod.rs".to_string(), "pub fn f() {}\n".to_string()),
    ]);

    let pushed = setup
        .fixture
        .create_and_push_repo(&repo, Some(files))
        .expect("create and push failed");

    let checkout = setup.temp_dir.path().join("checkout");
    fs::create_dir_all(&checkout).unwrap();
    setup
        .fixture
        .clone_repo(&pushed.repo.clone_url, Some(&checkout), &CloneOptions::default())
        .expect("clone failed");

    let work = checkout.join("testrepo");
    assert_eq!(fs::read_to_string(work.join("README.md")).unwrap(), "# files\n");
    assert_eq!(
        fs::read_to_string(work.join("src/lib/mod.rs")).unwrap(),
        "pub fn f() {}\n"
    );
    assert!(!work.join("myfile.txt").exists());
    assert_eq!(
        GitCli::default().rev_parse(&work, "HEAD").unwrap(),
        pushed.commit.id
    );
}

#[test]
fn second_push_is_waited_for_by_commit_id() {
    let setup = Setup::new();
    let repo = name("twice");
    let first = setup.fixture.create_and_push_repo(&repo, None).unwrap();

    let options = PushOptions {
        files: Some(BTreeMap::from([("second.txt".to_string(), "b".to_string())])),
        ..PushOptions::default()
    };
    let second = setup
        .fixture
        .push_repo(&first.repo.clone_url, &options)
        .expect("second push failed");
    assert_ne!(second, first.commit.id);

    // The mirror still serves the first commit until a refresh runs.
    assert_eq!(
        setup.host.get_commit(&repo, &rev("master")).unwrap().id,
        first.commit.id
    );
    assert_eq!(
        setup.host.get_commit(&repo, &rev(&second)),
        Err(ReadError::NotFound)
    );

    let visible = setup
        .fixture
        .wait_for_commit(&repo, &rev(&second))
        .expect("second commit never converged");
    assert_eq!(visible.id, second);
}

#[test]
fn delete_branch_leaves_only_the_target_branch() {
    let setup = Setup::new();
    let repo = name("branches");
    let hosted = setup.fixture.create_repo(&repo, None).unwrap();

    let options = PushOptions {
        delete_branch: true,
        ..PushOptions::default()
    };
    let pushed = setup
        .fixture
        .push_repo(&hosted.clone_url, &options)
        .expect("push with branch deletion failed");

    let origin = git::open_repository(&setup.host.origin_dir(&repo)).unwrap();
    assert!(origin.find_branch("tmpbranch", git2::BranchType::Local).is_err());
    assert_eq!(setup.origin_head(&repo, "master"), pushed);
}

#[test]
fn clone_with_empty_fetch_into_temp_dir() {
    let setup = Setup::new();
    let pushed = setup
        .fixture
        .create_and_push_repo(&name("cloneable"), None)
        .unwrap();

    let options = CloneOptions {
        args: vec!["--depth=1".to_string(), "--no-local".to_string()],
        empty_fetch: true,
    };
    setup
        .fixture
        .clone_repo(&pushed.repo.clone_url, None, &options)
        .expect("clone with empty fetch failed");
}

#[test]
fn clone_of_missing_repo_reports_git_output() {
    let setup = Setup::new();
    let missing = setup.temp_dir.path().join("missing.git");

    let err = setup
        .fixture
        .clone_repo(missing.to_str().unwrap(), None, &CloneOptions::default())
        .unwrap_err();

    assert!(matches!(err, FixtureError::Git(_)));
    let output = err.command_output().expect("output should be captured");
    assert!(output.contains("missing.git"), "output was {:?}", output);
}

#[test]
fn ensure_repo_exists_for_seeded_mirror() {
    let setup = Setup::new();
    let cli = GitCli::default();
    let source = setup.temp_dir.path().join("source");
    seed_source(&cli, &source, setup.temp_dir.path());

    let repo = name("mirrors/upstream");
    let hosted = setup
        .fixture
        .create_repo(&repo, Some(source.to_str().unwrap()))
        .expect("mirror creation failed");
    assert_eq!(hosted.default_branch, "main");

    let commit = setup
        .fixture
        .ensure_repo_exists(&repo)
        .expect("mirror never became readable");
    assert_eq!(commit.id, cli.rev_parse(&source, "main").unwrap());
    assert_eq!(setup.host.get_repo(&repo).unwrap(), hosted);
}

#[test]
fn ensure_repo_exists_times_out_for_empty_repo() {
    let setup = Setup::with_wait(Duration::from_millis(200));
    let repo = name("empty");
    setup.fixture.create_repo(&repo, None).unwrap();

    let err = setup.fixture.ensure_repo_exists(&repo).unwrap_err();

    match err {
        FixtureError::NotConverged { repo, rev, waited } => {
            assert_eq!(repo, "empty");
            assert_eq!(rev, "master");
            assert!(waited >= Duration::from_millis(200));
        }
        other => panic!("expected NotConverged, got {:?}", other),
    }
}

/// Bare repo on `main` with one commit, built outside the host.
fn seed_source(cli: &GitCli, source: &Path, scratch: &Path) {
    cli.init_bare(source, "main").unwrap();
    cli.clone_worktree(source.to_str().unwrap(), scratch, "seed-work", &[])
        .unwrap();
    let work = scratch.join("seed-work");
    fs::write(work.join("seed.txt"), "seed").unwrap();
    cli.add(&work, "seed.txt").unwrap();
    cli.commit(&work, "seed", &Default::default()).unwrap();
    cli.push(&work, "origin", "HEAD:refs/heads/main").unwrap();
}
