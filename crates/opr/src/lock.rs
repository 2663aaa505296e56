//! Whole-file advisory locks on the repository.
//!
//! `flock` is taken non-blocking and retried on contention after a short
//! sleep, up to a fixed number of retries, so a stuck peer shows up as a
//! lock timeout instead of a hang. The guard unlocks on drop, which covers
//! every early return.
//!
//! Writers replace the repository by renaming a new file over it, so a lock
//! only counts once the locked inode is still the one at the path. A peer
//! that opened the old file and waited on it reopens and locks again.

use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::debug;

use crate::error::{RepoError, Result};

/// Retry behaviour for lock acquisition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    /// Retries after the first failed attempt
    pub retries: u32,
    /// Sleep between attempts
    pub interval: Duration,
}

impl Default for LockPolicy {
    fn default() -> Self {
        Self {
            retries: 100,
            interval: Duration::from_millis(40),
        }
    }
}

impl From<&opr_core::Config> for LockPolicy {
    fn from(config: &opr_core::Config) -> Self {
        Self {
            retries: config.lock_retries,
            interval: Duration::from_millis(config.lock_interval_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl LockMode {
    fn operation(self) -> libc::c_int {
        match self {
            Self::Shared => libc::LOCK_SH,
            Self::Exclusive => libc::LOCK_EX,
        }
    }
}

/// Holds a lock on a repository file for its lifetime
#[derive(Debug)]
pub struct FileLock {
    file: File,
    mode: LockMode,
}

impl FileLock {
    /// Open `path` and lock the file that is there once the lock is held
    pub fn open(path: &Path, mode: LockMode, policy: LockPolicy) -> Result<Self> {
        let attempts = policy.retries.saturating_add(1);

        for reopen in 1..=attempts {
            let file = File::open(path)
                .map_err(|e| RepoError::io(format!("unable to open {}", path.display()), e))?;
            let lock = Self::acquire(file, path, mode, policy)?;
            if lock.is_current(path)? {
                return Ok(lock);
            }
            debug!(path = %path.display(), ?mode, reopen, "file replaced while waiting, reopening");
        }

        Err(RepoError::LockTimeout {
            path: path.to_path_buf(),
            attempts,
        })
    }

    /// Lock an already open `file` (opened from `path`), retrying per `policy`
    pub fn acquire(file: File, path: &Path, mode: LockMode, policy: LockPolicy) -> Result<Self> {
        let attempts = policy.retries.saturating_add(1);

        for attempt in 1..=attempts {
            let locked = try_lock(&file, mode)
                .map_err(|e| RepoError::io(format!("error locking {}", path.display()), e))?;
            if locked {
                debug!(path = %path.display(), ?mode, attempt, "lock acquired");
                return Ok(Self { file, mode });
            }
            if attempt < attempts {
                debug!(path = %path.display(), ?mode, attempt, "lock busy, sleeping");
                thread::sleep(policy.interval);
            }
        }

        Err(RepoError::LockTimeout {
            path: path.to_path_buf(),
            attempts,
        })
    }

    /// Whether the locked file is still the one at `path`
    pub fn is_current(&self, path: &Path) -> Result<bool> {
        let held = self
            .file
            .metadata()
            .map_err(|e| RepoError::io(format!("unable to stat {}", path.display()), e))?;
        let now = fs::metadata(path)
            .map_err(|e| RepoError::io(format!("unable to stat {}", path.display()), e))?;
        Ok(held.dev() == now.dev() && held.ino() == now.ino())
    }

    pub fn file(&self) -> &File {
        &self.file
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        let _ = unsafe { libc::flock(fd, libc::LOCK_UN) };
    }
}

fn try_lock(file: &File, mode: LockMode) -> io::Result<bool> {
    let fd = file.as_raw_fd();
    loop {
        let result = unsafe { libc::flock(fd, mode.operation() | libc::LOCK_NB) };
        if result == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(false),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}
