//! Per-job advisory locks shared between processes.
//!
//! Each logical job ID owns `job_<hexJobID>.lock` in the spool directory.
//! The holder keeps an exclusive `flock(2)` on it and writes its PID into the
//! file so contenders can name it. The file is unlinked on release while the
//! lock is still held; acquirers check that the inode they locked is still
//! the one linked at the path and start over otherwise.

use crate::error::{Result, SpoolError};
use common::uniq_id::{encode_job_id, lock_file_name};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::{MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

const LOCK_FILE_MODE: u32 = 0o666;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            interval,
        }
    }

    /// Longest time an acquisition may block before giving up.
    pub fn max_wait(&self) -> Duration {
        self.interval * self.attempts.saturating_sub(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(20, Duration::from_millis(500))
    }
}

pub struct LockCoordinator {
    dir: PathBuf,
    policy: RetryPolicy,
}

impl LockCoordinator {
    pub fn new(dir: impl Into<PathBuf>, policy: RetryPolicy) -> Self {
        Self {
            dir: dir.into(),
            policy,
        }
    }

    pub fn lock_path(&self, encoded_job_id: &str) -> PathBuf {
        self.dir.join(lock_file_name(encoded_job_id))
    }

    /// Blocks for at most `policy.max_wait()` trying to lock `job_id`.
    /// The spool directory must already exist.
    pub fn acquire(&self, job_id: &str) -> Result<JobLock> {
        self.acquire_encoded(job_id, &encode_job_id(job_id))
    }

    /// Same as `acquire` for callers that only know the encoded ID.
    /// `label` is used in diagnostics.
    pub(crate) fn acquire_encoded(&self, label: &str, encoded_job_id: &str) -> Result<JobLock> {
        let path = self.lock_path(encoded_job_id);
        let mut attempt = 0;
        loop {
            match try_lock(&path) {
                Ok(Some(file)) => {
                    log::debug!("job {}: acquired lock {:?}", label, path);
                    return Ok(JobLock {
                        file,
                        path,
                        label: label.to_string(),
                    });
                }
                Ok(None) => {}
                Err(source) => {
                    return Err(SpoolError::Lock {
                        job_id: label.to_string(),
                        path,
                        source,
                    })
                }
            }

            attempt += 1;
            let owner = describe_owner(&path);
            if attempt >= self.policy.attempts {
                return Err(SpoolError::LockContended {
                    job_id: label.to_string(),
                    path,
                    attempts: attempt,
                    owner,
                    source: Errno::EWOULDBLOCK.into(),
                });
            }

            log::error!(
                "job {}: could not get lock. Lockfile owner: {}. Attempt {} of {}, retrying in {:?}",
                label,
                owner,
                attempt,
                self.policy.attempts,
                self.policy.interval
            );
            std::thread::sleep(self.policy.interval);
        }
    }
}

/// Exclusive hold on one job ID's lock file. Released on drop.
#[derive(Debug)]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct JobLock {
    file: File,
    path: PathBuf,
    label: String,
}

impl JobLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for JobLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::error!("job {}: could not remove lock file {:?}: {}", self.label, self.path, e);
            }
        }
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            log::error!("job {}: could not release lock {:?}: {}", self.label, self.path, e);
        }
    }
}

/// `Ok(None)` while another holder has the lock.
fn try_lock(path: &Path) -> io::Result<Option<File>> {
    loop {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(LOCK_FILE_MODE)
            .open(path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {}
            Err(Errno::EWOULDBLOCK) => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        // The previous holder may have unlinked this inode before we got it.
        let held = file.metadata()?;
        match fs::metadata(path) {
            Ok(linked) if linked.dev() == held.dev() && linked.ino() == held.ino() => {}
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }

        file.set_len(0)?;
        file.seek(SeekFrom::Start(0))?;
        writeln!(file, "{}", std::process::id())?;
        file.flush()?;
        return Ok(Some(file));
    }
}

/// Best-effort description of the process holding `path`.
pub fn describe_owner(path: &Path) -> String {
    match read_owner(path) {
        Ok(Some(pid)) => match kill(pid, None::<Signal>) {
            Ok(()) | Err(Errno::EPERM) => format!("process with id {}", pid),
            Err(_) => format!("process with id {} (not running)", pid),
        },
        Ok(None) => "<unknown>".to_string(),
        Err(e) => format!("could not get lock owner info: {}", e),
    }
}

fn read_owner(path: &Path) -> io::Result<Option<Pid>> {
    let mut content = String::new();
    match File::open(path) {
        Ok(mut file) => {
            file.read_to_string(&mut content)?;
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    }

    let content = content.trim();
    if content.is_empty() {
        return Ok(None);
    }
    content
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
        .map(|pid| Some(Pid::from_raw(pid)))
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("invalid pid {:?}", content)))
}
