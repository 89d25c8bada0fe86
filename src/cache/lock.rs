//! Per-cache-entry locking (§4.5): readers take a shared lock, writers
//! take an exclusive one, both with a timeout and RAII release so a
//! lock is never leaked across a panic-unwind or an early `?` return.
//!
//! Implemented with advisory `flock(2)` via `nix` rather than a literal
//! FIFO: a FIFO has no notion of "N concurrent shared holders", while
//! `flock`'s `LOCK_SH`/`LOCK_EX` distinction gives exactly the
//! shared/exclusive semantics a cache entry needs.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use nix::fcntl::{flock, FlockArg};
use std::os::unix::io::AsRawFd;

use crate::error::{FlowError, Result};

pub enum LockKind {
    Shared,
    Exclusive,
}

impl LockKind {
    fn label(&self) -> &'static str {
        match self {
            LockKind::Shared => "shared",
            LockKind::Exclusive => "exclusive",
        }
    }

    fn flock_arg(&self, nonblocking: bool) -> FlockArg {
        match (self, nonblocking) {
            (LockKind::Shared, true) => FlockArg::LockSharedNonblock,
            (LockKind::Shared, false) => FlockArg::LockShared,
            (LockKind::Exclusive, true) => FlockArg::LockExclusiveNonblock,
            (LockKind::Exclusive, false) => FlockArg::LockExclusive,
        }
    }
}

/// Holds an open `.lock` file descriptor with an `flock` held on it.
/// Dropping the guard releases the lock (`flock(..., Unlock)`) and
/// closes the file, regardless of how the scope was exited.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = flock(self.file.as_raw_fd(), FlockArg::Unlock);
    }
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Acquire a lock on `<key_dir>/.lock`, creating the file if absent
/// (idempotent creation), blocking in short intervals until `timeout`
/// elapses.
pub fn acquire(key: &str, key_dir: &Path, kind: LockKind, timeout: Duration) -> Result<LockGuard> {
    std::fs::create_dir_all(key_dir).map_err(FlowError::Io)?;
    let lock_path = key_dir.join(".lock");
    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .open(&lock_path)
        .map_err(FlowError::Io)?;

    let deadline = Instant::now() + timeout;
    loop {
        match flock(file.as_raw_fd(), kind.flock_arg(true)) {
            Ok(()) => {
                return Ok(LockGuard {
                    file,
                    path: lock_path,
                })
            }
            Err(nix::errno::Errno::EWOULDBLOCK) => {
                if Instant::now() >= deadline {
                    return Err(FlowError::LockTimeout {
                        key: key.to_string(),
                        kind: kind.label().to_string(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
                std::thread::sleep(Duration::from_millis(10));
            }
            Err(e) => {
                return Err(FlowError::LockTimeout {
                    key: key.to_string(),
                    kind: format!("{} ({e})", kind.label()),
                    timeout_secs: timeout.as_secs(),
                })
            }
        }
    }
}
