use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{Duration, Instant};

use fs2::FileExt;

const MIN_BACKOFF: Duration = Duration::from_millis(10);
const MAX_BACKOFF: Duration = Duration::from_millis(250);

/// Exclusive advisory lock serializing refreshes of one hosted repository,
/// across threads and across processes sharing a host root.
///
/// The holder writes `pid <pid> (<thread>)` into the lock file so a waiter
/// that gives up can say who it was waiting on. Released when dropped.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
}

impl RepoLock {
    /// Block until the lock is held or `timeout` elapses
    /// (`ErrorKind::TimedOut`, naming the current holder).
    pub fn acquire(lock_path: &Path, timeout: Duration) -> io::Result<Self> {
        // Lock files live next to each other under <root>/locks
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(lock_path)?;

        let start = Instant::now();
        let mut backoff = MIN_BACKOFF;
        let mut logged = false;

        while !try_lock(&file)? {
            if start.elapsed() >= timeout {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!(
                        "lock {} not acquired within {:?} (held by {})",
                        lock_path.display(),
                        timeout,
                        read_holder(&mut file)
                    ),
                ));
            }
            if !logged {
                log::debug!(
                    "waiting for lock {} held by {}",
                    lock_path.display(),
                    read_holder(&mut file)
                );
                logged = true;
            }
            std::thread::sleep(backoff);
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }

        // Ours now; record who holds it
        write_holder(&mut file)?;
        Ok(Self { file })
    }
}

/// `Ok(false)` while someone else holds the lock.
fn try_lock(file: &File) -> io::Result<bool> {
    match file.try_lock_exclusive() {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(e),
    }
}

fn write_holder(file: &mut File) -> io::Result<()> {
    let thread = std::thread::current();
    let holder = format!(
        "pid {} ({})",
        std::process::id(),
        thread.name().unwrap_or("unnamed")
    );
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(holder.as_bytes())
}

fn read_holder(file: &mut File) -> String {
    let mut holder = String::new();
    let read = file
        .seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_string(&mut holder));
    match read {
        Ok(_) if !holder.trim().is_empty() => holder.trim().to_string(),
        _ => "an unknown holder".to_string(),
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
    }
}
