//! Convergence poller: wait for a commit to become visible on the read side.
//!
//! Each [`ConvergencePoller::poll`] spawns one worker thread that runs the
//! read/sleep loop and races it against a deadline timer. The worker reports
//! through a single-use channel; once the deadline wins, that channel's
//! receiver is gone and anything the worker sends afterwards is dropped.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Sender, at, bounded, select};
use serde::Serialize;
use thiserror::Error;

use super::ports::{CommitSnapshot, ReadError, RefreshError, RemoteRead, RemoteRefresh};
use crate::types::{RepoName, Revision};

/// Invalid poll parameters.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("max wait must be greater than zero")]
    ZeroWait,
    #[error("retry interval must be greater than zero")]
    ZeroInterval,
}

/// What to wait for and for how long.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollRequest {
    repo: RepoName,
    rev: Revision,
    max_wait: Duration,
    retry_interval: Duration,
}

impl PollRequest {
    /// Both durations must be non-zero. An interval longer than `max_wait` is
    /// allowed and simply means a single read before the deadline.
    pub fn new(
        repo: RepoName,
        rev: Revision,
        max_wait: Duration,
        retry_interval: Duration,
    ) -> Result<Self, RequestError> {
        if max_wait.is_zero() {
            return Err(RequestError::ZeroWait);
        }
        if retry_interval.is_zero() {
            return Err(RequestError::ZeroInterval);
        }
        Ok(Self {
            repo,
            rev,
            max_wait,
            retry_interval,
        })
    }

    pub fn repo(&self) -> &RepoName {
        &self.repo
    }

    pub fn rev(&self) -> &Revision {
        &self.rev
    }

    pub fn max_wait(&self) -> Duration {
        self.max_wait
    }

    pub fn retry_interval(&self) -> Duration {
        self.retry_interval
    }
}

/// Fatal poll failures. Timeouts are reported separately as
/// [`PollOutcome::TimedOut`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("failed to get revision {rev} of repo {repo}: {message}")]
    Remote {
        repo: String,
        rev: String,
        message: String,
    },
    #[error("failed to trigger VCS refresh for repo {repo}: {source}")]
    Refresh {
        repo: String,
        #[source]
        source: RefreshError,
    },
    #[error("poll worker failed: {0}")]
    Worker(String),
}

/// Result of one poll. Exactly one of these is produced per call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Converged(CommitSnapshot),
    TimedOut { waited: Duration },
    Failed(PollError),
}

impl PollOutcome {
    pub fn is_converged(&self) -> bool {
        matches!(self, PollOutcome::Converged(_))
    }

    pub fn commit(&self) -> Option<&CommitSnapshot> {
        match self {
            PollOutcome::Converged(commit) => Some(commit),
            _ => None,
        }
    }

    /// Short machine-readable label.
    pub fn kind(&self) -> &'static str {
        match self {
            PollOutcome::Converged(_) => "converged",
            PollOutcome::TimedOut { .. } => "timed_out",
            PollOutcome::Failed(_) => "failed",
        }
    }
}

/// Serializable summary of a poll, for CLI output.
#[derive(Debug, Clone, Serialize)]
pub struct PollReport {
    pub repo: String,
    pub rev: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub elapsed_ms: u64,
}

impl PollReport {
    pub fn new(request: &PollRequest, outcome: &PollOutcome, elapsed: Duration) -> Self {
        let error = match outcome {
            PollOutcome::Converged(_) => None,
            PollOutcome::TimedOut { waited } => Some(format!(
                "repo {} revision {} not found on remote after waiting {:?}",
                request.repo, request.rev, waited
            )),
            PollOutcome::Failed(e) => Some(e.to_string()),
        };
        Self {
            repo: request.repo.to_string(),
            rev: request.rev.to_string(),
            outcome: outcome.kind(),
            commit: outcome.commit().cloned(),
            error,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }
}

/// Polls a read port until a revision shows up, nudging replication once.
#[derive(Clone)]
pub struct ConvergencePoller {
    reader: Arc<dyn RemoteRead>,
    refresher: Arc<dyn RemoteRefresh>,
}

impl ConvergencePoller {
    pub fn new(reader: Arc<dyn RemoteRead>, refresher: Arc<dyn RemoteRefresh>) -> Self {
        Self { reader, refresher }
    }

    /// Block until the revision is visible, a fatal error occurs, or
    /// `max_wait` (measured from this call) elapses.
    pub fn poll(&self, request: &PollRequest) -> PollOutcome {
        let started = Instant::now();
        let deadline = started + request.max_wait;
        let (tx, rx) = bounded(1);

        let worker = PollWorker {
            reader: Arc::clone(&self.reader),
            refresher: Arc::clone(&self.refresher),
            request: request.clone(),
            deadline,
        };
        let spawned = thread::Builder::new()
            .name("vcsconverge-poll".to_string())
            .spawn(move || worker.run(tx));
        if let Err(e) = spawned {
            return PollOutcome::Failed(PollError::Worker(format!(
                "failed to spawn poll worker: {}",
                e
            )));
        }

        let timed_out = || {
            let waited = started.elapsed();
            log::warn!(
                "repo {} revision {} not found on remote, even after triggering a VCS refresh and waiting {:?}",
                request.repo,
                request.rev,
                waited
            );
            PollOutcome::TimedOut { waited }
        };

        select! {
            recv(rx) -> msg => match msg {
                Ok(outcome) => outcome,
                // The worker gives up silently once the deadline has passed.
                Err(_) if Instant::now() >= deadline => timed_out(),
                Err(_) => PollOutcome::Failed(PollError::Worker(
                    "poll worker exited without a result".to_string(),
                )),
            },
            recv(at(deadline)) -> _ => timed_out(),
        }
    }
}

/// State owned by the worker thread for one poll.
struct PollWorker {
    reader: Arc<dyn RemoteRead>,
    refresher: Arc<dyn RemoteRefresh>,
    request: PollRequest,
    deadline: Instant,
}

impl PollWorker {
    fn run(self, result: Sender<PollOutcome>) {
        if let Some(outcome) = self.poll_loop() {
            // Receiver is gone if the deadline already won.
            let _ = result.send(outcome);
        }
    }

    /// `None` means the deadline passed while sleeping.
    fn poll_loop(&self) -> Option<PollOutcome> {
        let PollRequest {
            repo,
            rev,
            max_wait,
            retry_interval,
        } = &self.request;
        let mut refresh_triggered = false;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            match self.reader.get_commit(repo, rev) {
                Ok(commit) => {
                    log::info!(
                        "repo {} revision {} visible as {} (attempt {})",
                        repo,
                        rev,
                        commit.id,
                        attempt
                    );
                    return Some(PollOutcome::Converged(commit));
                }
                Err(ReadError::Remote(message)) => {
                    return Some(PollOutcome::Failed(PollError::Remote {
                        repo: repo.to_string(),
                        rev: rev.to_string(),
                        message,
                    }));
                }
                Err(ReadError::NotFound) => {}
            }

            if !refresh_triggered {
                if let Err(source) = self.refresher.trigger_refresh(repo) {
                    return Some(PollOutcome::Failed(PollError::Refresh {
                        repo: repo.to_string(),
                        source,
                    }));
                }
                log::info!(
                    "repo {} revision {} not on remote; triggered refresh of VCS data, waiting {:?}",
                    repo,
                    rev,
                    max_wait
                );
                refresh_triggered = true;
            } else {
                log::debug!(
                    "repo {} revision {} still not on remote (attempt {})",
                    repo,
                    rev,
                    attempt
                );
            }

            thread::sleep(*retry_interval);

            if Instant::now() >= self.deadline {
                log::debug!("poll for {} {} past its deadline, stopping", repo, rev);
                return None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn commit(id: &str) -> CommitSnapshot {
        CommitSnapshot {
            id: id.to_string(),
            author_name: "a".to_string(),
            author_email: "a@a.com".to_string(),
            timestamp: 1136214245,
            summary: "hello".to_string(),
        }
    }

    /// Replays a script of read results; the last entry repeats forever.
    struct ScriptedRead {
        script: Mutex<VecDeque<Result<CommitSnapshot, ReadError>>>,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl ScriptedRead {
        fn new(script: Vec<Result<CommitSnapshot, ReadError>>) -> Arc<Self> {
            Self::with_delay(script, Duration::ZERO)
        }

        fn with_delay(script: Vec<Result<CommitSnapshot, ReadError>>, delay: Duration) -> Arc<Self> {
            assert!(!script.is_empty());
            Arc::new(Self {
                script: Mutex::new(script.into()),
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteRead for ScriptedRead {
        fn get_commit(&self, _: &RepoName, _: &Revision) -> Result<CommitSnapshot, ReadError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                thread::sleep(self.delay);
            }
            let mut script = self.script.lock().unwrap();
            if script.len() > 1 {
                script.pop_front().unwrap()
            } else {
                script.front().cloned().unwrap()
            }
        }
    }

    struct CountingRefresh {
        fail: Option<RefreshError>,
        calls: AtomicUsize,
    }

    impl CountingRefresh {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                fail: None,
                calls: AtomicUsize::new(0),
            })
        }

        fn failing(err: RefreshError) -> Arc<Self> {
            Arc::new(Self {
                fail: Some(err),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl RemoteRefresh for CountingRefresh {
        fn trigger_refresh(&self, _: &RepoName) -> Result<(), RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.fail {
                Some(err) => Err(err.clone()),
                None => Ok(()),
            }
        }
    }

    fn request(max_wait_ms: u64, interval_ms: u64) -> PollRequest {
        PollRequest::new(
            "example.com/team/app".parse().unwrap(),
            "master".parse().unwrap(),
            Duration::from_millis(max_wait_ms),
            Duration::from_millis(interval_ms),
        )
        .unwrap()
    }

    fn poller(read: &Arc<ScriptedRead>, refresh: &Arc<CountingRefresh>) -> ConvergencePoller {
        ConvergencePoller::new(read.clone(), refresh.clone())
    }

    #[test]
    fn found_first_converges_without_refresh() {
        let read = ScriptedRead::new(vec![Ok(commit("abc"))]);
        let refresh = CountingRefresh::ok();

        let outcome = poller(&read, &refresh).poll(&request(1000, 100));

        assert_eq!(outcome, PollOutcome::Converged(commit("abc")));
        assert_eq!(read.calls(), 1);
        assert_eq!(refresh.calls(), 0);
    }

    #[test]
    fn not_found_once_triggers_exactly_one_refresh() {
        let read = ScriptedRead::new(vec![Err(ReadError::NotFound), Ok(commit("abc"))]);
        let refresh = CountingRefresh::ok();

        let outcome = poller(&read, &refresh).poll(&request(2000, 20));

        assert_eq!(outcome.commit().map(|c| c.id.as_str()), Some("abc"));
        assert_eq!(read.calls(), 2);
        assert_eq!(refresh.calls(), 1);
    }

    #[test]
    fn persistent_not_found_times_out_with_a_single_refresh() {
        let read = ScriptedRead::new(vec![Err(ReadError::NotFound)]);
        let refresh = CountingRefresh::ok();
        let start = Instant::now();

        let outcome = poller(&read, &refresh).poll(&request(300, 100));
        let elapsed = start.elapsed();

        match outcome {
            PollOutcome::TimedOut { waited } => assert!(waited >= Duration::from_millis(300)),
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_millis(1000), "took {:?}", elapsed);
        assert!(read.calls() >= 2, "reads: {}", read.calls());

        // Give the abandoned worker time to notice the deadline.
        thread::sleep(Duration::from_millis(250));
        assert_eq!(refresh.calls(), 1);
        let reads_after_stop = read.calls();
        thread::sleep(Duration::from_millis(250));
        assert_eq!(read.calls(), reads_after_stop, "worker kept polling past deadline");
    }

    #[test]
    fn remote_error_fails_immediately_without_sleeping() {
        let read = ScriptedRead::new(vec![Err(ReadError::Remote("permission denied".into()))]);
        let refresh = CountingRefresh::ok();
        let start = Instant::now();

        let outcome = poller(&read, &refresh).poll(&request(5000, 1000));

        assert!(start.elapsed() < Duration::from_millis(500));
        match outcome {
            PollOutcome::Failed(PollError::Remote { message, repo, rev }) => {
                assert_eq!(message, "permission denied");
                assert_eq!(repo, "example.com/team/app");
                assert_eq!(rev, "master");
            }
            other => panic!("expected remote failure, got {:?}", other),
        }
        assert_eq!(read.calls(), 1);
        assert_eq!(refresh.calls(), 0);
    }

    #[test]
    fn remote_error_after_not_found_is_not_retried() {
        let read = ScriptedRead::new(vec![
            Err(ReadError::NotFound),
            Err(ReadError::Remote("boom".into())),
            Ok(commit("never")),
        ]);
        let refresh = CountingRefresh::ok();

        let outcome = poller(&read, &refresh).poll(&request(2000, 10));

        assert!(matches!(outcome, PollOutcome::Failed(PollError::Remote { .. })));
        assert_eq!(read.calls(), 2);
    }

    #[test]
    fn refresh_failure_is_fatal_and_stops_reading() {
        let read = ScriptedRead::new(vec![Err(ReadError::NotFound), Ok(commit("abc"))]);
        let refresh = CountingRefresh::failing(RefreshError::Remote("refresh endpoint down".into()));
        let start = Instant::now();

        let outcome = poller(&read, &refresh).poll(&request(5000, 1000));

        assert!(start.elapsed() < Duration::from_millis(500));
        match &outcome {
            PollOutcome::Failed(err @ PollError::Refresh { source, .. }) => {
                assert_eq!(source, &RefreshError::Remote("refresh endpoint down".into()));
                assert!(err.to_string().contains("failed to trigger VCS refresh"));
            }
            other => panic!("expected refresh failure, got {:?}", other),
        }
        assert_eq!(read.calls(), 1);
        assert_eq!(refresh.calls(), 1);
    }

    #[test]
    fn repeated_polls_against_visible_commit_are_side_effect_free() {
        let read = ScriptedRead::new(vec![Ok(commit("abc"))]);
        let refresh = CountingRefresh::ok();
        let poller = poller(&read, &refresh);
        let req = request(1000, 100);

        assert_eq!(poller.poll(&req), PollOutcome::Converged(commit("abc")));
        assert_eq!(poller.poll(&req), PollOutcome::Converged(commit("abc")));
        assert_eq!(read.calls(), 2);
        assert_eq!(refresh.calls(), 0);
    }

    #[test]
    fn converges_after_two_retries_in_about_two_intervals() {
        let read = ScriptedRead::new(vec![
            Err(ReadError::NotFound),
            Err(ReadError::NotFound),
            Ok(commit("abc")),
        ]);
        let refresh = CountingRefresh::ok();
        let start = Instant::now();

        let outcome = poller(&read, &refresh).poll(&request(500, 100));
        let elapsed = start.elapsed();

        assert!(outcome.is_converged(), "got {:?}", outcome);
        assert_eq!(refresh.calls(), 1);
        assert_eq!(read.calls(), 3);
        assert!(elapsed >= Duration::from_millis(200), "took {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(450), "took {:?}", elapsed);
    }

    #[test]
    fn read_completing_after_deadline_is_discarded() {
        let read = ScriptedRead::with_delay(vec![Ok(commit("late"))], Duration::from_millis(400));
        let refresh = CountingRefresh::ok();
        let start = Instant::now();

        let outcome = poller(&read, &refresh).poll(&request(100, 50));

        assert!(matches!(outcome, PollOutcome::TimedOut { .. }), "got {:?}", outcome);
        assert!(start.elapsed() < Duration::from_millis(350));
        // Let the worker finish its read and try to report into the closed slot.
        thread::sleep(Duration::from_millis(450));
        assert_eq!(read.calls(), 1);
    }

    #[test]
    fn interval_longer_than_wait_reads_once() {
        let read = ScriptedRead::new(vec![Err(ReadError::NotFound)]);
        let refresh = CountingRefresh::ok();

        let outcome = poller(&read, &refresh).poll(&request(100, 1000));

        assert!(matches!(outcome, PollOutcome::TimedOut { .. }));
        assert_eq!(read.calls(), 1);
        assert_eq!(refresh.calls(), 1);
    }

    #[test]
    fn request_rejects_zero_durations() {
        let repo: RepoName = "app".parse().unwrap();
        let rev: Revision = "master".parse().unwrap();

        assert_eq!(
            PollRequest::new(repo.clone(), rev.clone(), Duration::ZERO, Duration::from_secs(1)),
            Err(RequestError::ZeroWait)
        );
        assert_eq!(
            PollRequest::new(repo, rev, Duration::from_secs(1), Duration::ZERO),
            Err(RequestError::ZeroInterval)
        );
    }

    #[test]
    fn report_summarizes_each_outcome() {
        let req = request(500, 100);

        let converged = PollReport::new(&req, &PollOutcome::Converged(commit("abc")), Duration::from_millis(12));
        assert_eq!(converged.outcome, "converged");
        assert_eq!(converged.elapsed_ms, 12);
        let json = serde_json::to_value(&converged).unwrap();
        assert_eq!(json["commit"]["id"], "abc");
        assert!(json.get("error").is_none());

        let timed_out = PollReport::new(
            &req,
            &PollOutcome::TimedOut {
                waited: Duration::from_millis(500),
            },
            Duration::from_millis(500),
        );
        assert_eq!(timed_out.outcome, "timed_out");
        assert!(timed_out.error.unwrap().contains("not found on remote"));

        let failed = PollReport::new(
            &req,
            &PollOutcome::Failed(PollError::Worker("gone".into())),
            Duration::ZERO,
        );
        assert_eq!(failed.outcome, "failed");
        assert_eq!(failed.error.as_deref(), Some("poll worker failed: gone"));
        assert!(failed.commit.is_none());
    }
}
