//! Process-wide single-instance guard backed by an advisory flock on the
//! pid file.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another agent instance is already running (lock: {0})")]
    AlreadyRunning(PathBuf),

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Holds an exclusive, non-blocking flock for the lifetime of the value.
/// The lock is released by [`InstanceLock::release`] or process termination.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn acquire(path: &Path) -> Result<Self, LockError> {
        let io_err = |source| LockError::Io {
            path: path.to_path_buf(),
            source,
        };

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)
            .map_err(io_err)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                return Err(LockError::AlreadyRunning(path.to_path_buf()));
            }
            return Err(io_err(err));
        }

        // Record our pid so operators can inspect the running process. The
        // lock itself, not the pid, is what enforces mutual exclusion.
        if file.set_len(0).is_ok() {
            let _ = file.seek(SeekFrom::Start(0));
            let _ = writeln!(file, "{}", std::process::id());
        }

        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Releases the lock and removes the pid file.
    pub fn release(self) {
        drop(self.file);
        let _ = fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_writes_pid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let lock = InstanceLock::acquire(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content.trim(), std::process::id().to_string());
        lock.release();
    }

    #[test]
    fn second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let lock = InstanceLock::acquire(&path).unwrap();
        let err = InstanceLock::acquire(&path).unwrap_err();
        assert!(matches!(err, LockError::AlreadyRunning(_)));
        lock.release();
    }

    #[test]
    fn release_removes_file_and_allows_reacquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.pid");

        let lock = InstanceLock::acquire(&path).unwrap();
        lock.release();
        assert!(!path.exists());

        let lock = InstanceLock::acquire(&path).unwrap();
        lock.release();
    }
}
