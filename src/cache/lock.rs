//! Cross-process lock scoped to one mirror.
//!
//! The lock is a file next to the mirror (`<mirror>.lock`) created with
//! `O_CREAT | O_EXCL` and holding the owner's pid in decimal. Existence means
//! locked. A holder that dies leaves the file behind; nothing but
//! [`Lockfile::unlock`] by the owner or an explicit [`Lockfile::break_lock`]
//! removes it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;

use super::paths::lock_path_for;
use super::retry::{RetryPolicy, retry};

/// Errors returned by lock operations.
#[derive(Error, Debug)]
pub enum LockError {
    /// Another holder owns the lock and no wait was requested.
    #[error("{} is already locked{}", .path.display(), owner_suffix(.owner))]
    Held { path: PathBuf, owner: Option<u32> },
    /// The lock stayed held for the whole timeout.
    #[error("timed out after {timeout:?} waiting for lock on {}{}", .path.display(), owner_suffix(.owner))]
    TimedOut {
        path: PathBuf,
        timeout: Duration,
        owner: Option<u32>,
    },
    /// Unlock was requested but no lock file exists.
    #[error("{} is not locked", .0.display())]
    NotLocked(PathBuf),
    /// Unlock was requested by a process that does not own the lock.
    #[error("{} is locked by another process{}", .path.display(), owner_suffix(.owner))]
    NotOwner { path: PathBuf, owner: Option<u32> },
    /// Creating, reading or removing the lock file failed.
    #[error("lock file {} failed: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

fn owner_suffix(owner: &Option<u32>) -> String {
    match owner {
        Some(pid) => format!(" (pid {})", pid),
        None => String::new(),
    }
}

/// Pid-file lock guarding one mirror directory.
#[derive(Debug, Clone)]
pub struct Lockfile {
    path: PathBuf,
    lockfile: PathBuf,
    pid: u32,
    retry: RetryPolicy,
}

impl Lockfile {
    /// Lock guarding `path`; the lock file itself is `<path>.lock`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let lockfile = lock_path_for(&path);
        Self {
            path,
            lockfile,
            pid: std::process::id(),
            retry: RetryPolicy::default(),
        }
    }

    /// Retry policy for lock file deletion.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[cfg(test)]
    fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }

    /// The lock file path.
    pub fn lockfile_path(&self) -> &Path {
        &self.lockfile
    }

    /// Acquire the lock.
    ///
    /// Without a timeout (or with a zero one) a held lock fails immediately
    /// with [`LockError::Held`]. With a timeout, polls with exponential backoff
    /// until the lock is free or the timeout elapses.
    pub fn lock(&self, timeout: Option<Duration>) -> Result<(), LockError> {
        let start = Instant::now();
        let mut sleep_duration = Duration::from_millis(10);
        let max_sleep = Duration::from_millis(500);
        let timeout = timeout.filter(|t| !t.is_zero());

        loop {
            let err = match self.try_create() {
                Ok(()) => {
                    log::debug!("locked {} (pid {})", self.path.display(), self.pid);
                    return Ok(());
                }
                Err(err) => err,
            };
            let held = err.kind() == io::ErrorKind::AlreadyExists;

            let remaining = timeout
                .and_then(|t| t.checked_sub(start.elapsed()))
                .filter(|r| !r.is_zero());
            let Some(remaining) = remaining else {
                return Err(match timeout {
                    _ if !held => LockError::Io {
                        path: self.lockfile.clone(),
                        source: err,
                    },
                    Some(timeout) => LockError::TimedOut {
                        path: self.path.clone(),
                        timeout,
                        owner: self.owner(),
                    },
                    None => LockError::Held {
                        path: self.path.clone(),
                        owner: self.owner(),
                    },
                });
            };

            if !held {
                log::debug!("creating {} failed: {}", self.lockfile.display(), err);
            }
            thread::sleep(sleep_duration.min(remaining));
            sleep_duration = (sleep_duration * 2).min(max_sleep);
        }
    }

    /// Release a lock held by this process.
    pub fn unlock(&self) -> Result<(), LockError> {
        let owner = match fs::read_to_string(&self.lockfile) {
            Ok(contents) => parse_pid(&contents),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(LockError::NotLocked(self.path.clone()));
            }
            Err(e) => {
                return Err(LockError::Io {
                    path: self.lockfile.clone(),
                    source: e,
                });
            }
        };

        if owner != Some(self.pid) {
            return Err(LockError::NotOwner {
                path: self.path.clone(),
                owner,
            });
        }

        self.remove_lockfile("unlock")?;
        log::debug!("unlocked {}", self.path.display());
        Ok(())
    }

    /// Remove the lock file whoever owns it. Returns whether a file was removed.
    pub fn break_lock(&self) -> Result<bool, LockError> {
        let removed = self.remove_lockfile("break lock")?;
        if removed {
            log::info!("broke lock on {}", self.path.display());
        }
        Ok(removed)
    }

    /// Whether a lock file exists. Advisory only.
    pub fn is_locked(&self) -> bool {
        self.lockfile.exists()
    }

    /// Whether the lock file names this process. Advisory only.
    pub fn i_am_locking(&self) -> bool {
        self.owner() == Some(self.pid)
    }

    /// Pid recorded in the lock file, if it exists and parses.
    pub fn owner(&self) -> Option<u32> {
        fs::read_to_string(&self.lockfile)
            .ok()
            .and_then(|contents| parse_pid(&contents))
    }

    fn try_create(&self) -> io::Result<()> {
        if let Some(parent) = self.lockfile.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lockfile)?;

        let written = file
            .write_all(self.pid.to_string().as_bytes())
            .and_then(|()| file.sync_all());
        if let Err(e) = written {
            let _ = fs::remove_file(&self.lockfile);
            return Err(e);
        }

        Ok(())
    }

    fn remove_lockfile(&self, name: &str) -> Result<bool, LockError> {
        let result = retry(
            &self.retry,
            name,
            || fs::remove_file(&self.lockfile),
            |e: &io::Error| e.kind() != io::ErrorKind::NotFound,
        );
        match result {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(LockError::Io {
                path: self.lockfile.clone(),
                source: e,
            }),
        }
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse().ok()
}

/// Whether a process with this pid currently exists. Diagnostic only.
pub fn process_is_running(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // Signal 0 runs the existence and permission checks without delivering anything.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}
