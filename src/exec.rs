//! Bounded external process execution with captured output.

use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, bounded};
use thiserror::Error;

/// Initial and maximum pause between `try_wait` polls.
const INITIAL_POLL: Duration = Duration::from_millis(5);
const MAX_POLL: Duration = Duration::from_millis(100);

/// How long to keep reading output once the process itself is gone.
const READER_GRACE: Duration = Duration::from_millis(500);

/// Errors from running an external command.
#[derive(Error, Debug)]
pub enum ExecError {
    /// The command could not be started or waited on.
    #[error("exec {command:?} failed: {source}")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    /// The command was killed after exceeding its timeout.
    #[error("exec {command:?} timed out after {after:?}\n{output}")]
    TimedOut {
        command: String,
        after: Duration,
        output: String,
    },
}

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub command: String,
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Stderr followed by stdout, for failure diagnostics.
    pub fn combined(&self) -> String {
        combine(&self.stdout, &self.stderr)
    }
}

fn combine(stdout: &str, stderr: &str) -> String {
    match (stderr.is_empty(), stdout.is_empty()) {
        (true, _) => stdout.to_string(),
        (false, true) => stderr.to_string(),
        (false, false) => format!("{stderr}\n{stdout}"),
    }
}

/// Render a command line for logs and error messages.
pub fn describe(cmd: &Command) -> String {
    std::iter::once(cmd.get_program())
        .chain(cmd.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run `cmd` to completion, killing it if it outlives `timeout`.
///
/// Stdout and stderr are drained on their own threads so a chatty child (git
/// with tracing enabled) cannot block on a full pipe. On unix the child leads
/// its own process group, and a timeout kills the whole group so helpers such
/// as `git-upload-pack` go down with it.
pub fn run(mut cmd: Command, timeout: Duration) -> Result<CommandOutput, ExecError> {
    let command = describe(&cmd);
    let io_err = |source| ExecError::Io {
        command: command.clone(),
        source,
    };

    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
    let mut child = cmd.spawn().map_err(io_err)?;
    // Drop our copies of the pipe ends held by the builder.
    drop(cmd);

    let stdout = child.stdout.take().map(Capture::spawn);
    let stderr = child.stderr.take().map(Capture::spawn);

    log::debug!(">>> START - {}", command);
    let status = wait_with_timeout(&mut child, timeout).map_err(io_err)?;

    // A leftover grandchild can hold the pipes open; don't wait on it forever.
    let drain_deadline = Instant::now() + READER_GRACE;
    let stdout = Capture::finish(stdout, drain_deadline);
    let stderr = Capture::finish(stderr, drain_deadline);
    log::debug!("{}", combine(&stdout, &stderr));
    log::debug!(">>> END - {}", command);

    match status {
        Some(status) => Ok(CommandOutput {
            command,
            status,
            stdout,
            stderr,
        }),
        None => Err(ExecError::TimedOut {
            command,
            after: timeout,
            output: combine(&stdout, &stderr),
        }),
    }
}

/// Poll the child with exponential backoff. `None` means it was killed.
fn wait_with_timeout(child: &mut Child, timeout: Duration) -> std::io::Result<Option<ExitStatus>> {
    let start = Instant::now();
    let mut sleep_duration = INITIAL_POLL;

    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            kill_tree(child);
            let _ = child.wait();
            return Ok(None);
        }
        thread::sleep(sleep_duration.min(timeout - elapsed));
        sleep_duration = (sleep_duration * 2).min(MAX_POLL);
    }
}

#[cfg(unix)]
fn kill_tree(child: &mut Child) {
    match libc::pid_t::try_from(child.id()) {
        // The child was spawned as a group leader, so its pid is the pgid.
        Ok(pgid) => unsafe {
            libc::kill(-pgid, libc::SIGKILL);
        },
        Err(_) => {
            let _ = child.kill();
        }
    }
}

#[cfg(not(unix))]
fn kill_tree(child: &mut Child) {
    let _ = child.kill();
}

/// Output collected from one pipe by a reader thread.
struct Capture {
    buf: Arc<Mutex<Vec<u8>>>,
    done: Receiver<()>,
}

impl Capture {
    fn spawn<R: Read + Send + 'static>(mut source: R) -> Self {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let (tx, done) = bounded(1);
        let sink = Arc::clone(&buf);

        thread::spawn(move || {
            let mut chunk = [0u8; 8192];
            loop {
                match source.read(&mut chunk) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => match sink.lock() {
                        Ok(mut buf) => buf.extend_from_slice(&chunk[..n]),
                        Err(_) => break,
                    },
                }
            }
            let _ = tx.send(());
        });

        Self { buf, done }
    }

    /// Whatever was read by `deadline`, complete or not.
    fn finish(capture: Option<Self>, deadline: Instant) -> String {
        let Some(capture) = capture else {
            return String::new();
        };
        if capture.done.recv_deadline(deadline).is_err() {
            log::debug!("output pipe still open after the process exited, truncating");
        }
        match capture.buf.lock() {
            Ok(buf) => String::from_utf8_lossy(&buf).into_owned(),
            Err(_) => String::new(),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", script]);
        cmd
    }

    #[test]
    fn captures_stdout_and_stderr() {
        let output = run(sh("echo out; echo err >&2"), Duration::from_secs(5)).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
        assert_eq!(output.combined(), "err\n\nout\n");
    }

    #[test]
    fn reports_nonzero_exit_with_output() {
        let output = run(sh("echo broken >&2; exit 3"), Duration::from_secs(5)).unwrap();
        assert!(!output.success());
        assert_eq!(output.status.code(), Some(3));
        assert!(output.combined().contains("broken"));
        assert!(output.command.starts_with("sh -c"));
    }

    #[test]
    fn kills_commands_that_exceed_the_timeout() {
        let start = Instant::now();
        let result = run(sh("echo started; exec sleep 10"), Duration::from_millis(200));
        match result {
            Err(ExecError::TimedOut { after, output, .. }) => {
                assert_eq!(after, Duration::from_millis(200));
                assert!(output.contains("started"), "output was {:?}", output);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn timeout_kills_grandchildren_holding_the_pipes() {
        let start = Instant::now();
        let result = run(
            sh("echo started; sleep 10 & sleep 10; wait"),
            Duration::from_millis(200),
        );
        match result {
            Err(ExecError::TimedOut { output, .. }) => {
                assert!(output.contains("started"), "output was {:?}", output);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn exited_command_does_not_wait_on_leftover_pipe_holders() {
        let start = Instant::now();
        let output = run(sh("echo done; sleep 10 &"), Duration::from_secs(5)).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "done");
        assert!(start.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn missing_binary_is_an_io_error() {
        let result = run(
            Command::new("/nonexistent/vcsconverge-test-binary"),
            Duration::from_secs(1),
        );
        assert!(matches!(result, Err(ExecError::Io { .. })));
    }

    #[test]
    fn describe_joins_program_and_args() {
        let mut cmd = Command::new("git");
        cmd.args(["push", "origin", "master"]);
        assert_eq!(describe(&cmd), "git push origin master");
    }
}
