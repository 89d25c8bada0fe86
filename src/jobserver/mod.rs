//! GNU Make-compatible job-token server (§4.7, C6): bounds concurrency
//! across the process tree via a FIFO-backed token pool.
//!
//! The owning scheduler instance creates a named FIFO, writes `nproc -
//! 1` tokens into it, and publishes `MAKEFLAGS=--jobserver-auth=fifo:<path>`
//! into its own environment so subprocesses (and nested invocations of
//! this tool) discover it. A process already holding its implicit
//! token (the one it was started with) does not acquire for its first
//! unit of work, so total effective concurrency is `nproc`.
//!
//! Ownership detection mirrors make's own convention: the absence of
//! `MAKEFLAGS`, or a `MAKEFLAGS` whose FIFO path doesn't exist/isn't
//! readable, makes this instance the owner; otherwise it attaches as a
//! participant and never creates or removes the FIFO.

use std::fs::OpenOptions;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(unix)]
use std::os::unix::fs::OpenOptionsExt;

use crate::error::{FlowError, Result};

const MAKEFLAGS_VAR: &str = "MAKEFLAGS";
const JOBSERVER_AUTH_PREFIX: &str = "--jobserver-auth=fifo:";

/// A single acquired token. Returning it (via `Drop`) writes one byte
/// back to the FIFO — the RAII guard releases even on panic-unwind or
/// an early `?` return (§4.5 lock design note applies equally here).
pub struct Token {
    server: Arc<JobServerInner>,
    /// The implicit token every process starts with is never written
    /// back to the FIFO; acquiring it is a no-op release too.
    implicit: bool,
}

impl Drop for Token {
    fn drop(&mut self) {
        if !self.implicit {
            self.server.release_one();
        }
    }
}

struct JobServerInner {
    fifo_path: PathBuf,
    /// `true` for the instance that created the FIFO; only the owner
    /// removes it on shutdown.
    owner: bool,
    nproc: usize,
}

impl JobServerInner {
    fn release_one(&self) {
        // Opened read-write so the open() call itself never blocks
        // waiting for a reader, which a write-only open on a FIFO would
        // do whenever no one else currently has it open for reading.
        if let Ok(mut f) = OpenOptions::new().read(true).write(true).open(&self.fifo_path) {
            let _ = f.write_all(b"+");
        }
    }
}

/// Bounds concurrency to `nproc` across this process and any child
/// processes that participate in the same jobserver (via `MAKEFLAGS`).
#[derive(Clone)]
pub struct JobServer {
    inner: Arc<JobServerInner>,
}

impl JobServer {
    /// Construct a jobserver for `nproc` total effective concurrency.
    /// If `MAKEFLAGS` already names a usable FIFO, attaches to it as a
    /// non-owning participant instead of creating a new one.
    ///
    /// `nproc < 1` is a programmer error (§4.7), not a recoverable
    /// runtime condition.
    pub fn new(nproc: usize, rundir: &Path) -> Result<Self> {
        if nproc < 1 {
            return Err(FlowError::InvalidNproc { nproc: nproc as i64 });
        }

        if let Some(path) = discover_fifo() {
            return Ok(Self {
                inner: Arc::new(JobServerInner {
                    fifo_path: path,
                    owner: false,
                    nproc,
                }),
            });
        }

        let fifo_path = rundir.join(format!(".flowmgr-jobserver-{}.fifo", std::process::id()));
        create_fifo(&fifo_path)?;

        // nproc - 1 tokens: the creating process itself holds the
        // implicit first unit of concurrency. Opened read-write so this
        // initial open never blocks waiting for a reader (see
        // `release_one`).
        {
            let mut f = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&fifo_path)
                .map_err(|e| FlowError::JobServerBroken { reason: e.to_string() })?;
            for _ in 0..nproc.saturating_sub(1) {
                f.write_all(b"+").map_err(|e| FlowError::JobServerBroken { reason: e.to_string() })?;
            }
        }

        publish_makeflags(&fifo_path);

        Ok(Self {
            inner: Arc::new(JobServerInner {
                fifo_path,
                owner: true,
                nproc,
            }),
        })
    }

    pub fn nproc(&self) -> usize {
        self.inner.nproc
    }

    pub fn is_owner(&self) -> bool {
        self.inner.owner
    }

    /// The process's own implicit token — free, never read from the
    /// FIFO, never written back.
    pub fn implicit_token(&self) -> Token {
        Token {
            server: Arc::clone(&self.inner),
            implicit: true,
        }
    }

    /// Acquire one token, blocking (via a polling read with backoff)
    /// until one is available or `timeout` elapses.
    pub async fn acquire(&self, timeout: Duration) -> Result<Token> {
        let deadline = Instant::now() + timeout;
        let path = self.inner.fifo_path.clone();
        loop {
            if try_read_one(&path)? {
                return Ok(Token {
                    server: Arc::clone(&self.inner),
                    implicit: false,
                });
            }
            if Instant::now() >= deadline {
                return Err(FlowError::JobserverTimeout {
                    timeout_secs: timeout.as_secs(),
                });
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for JobServerInner {
    fn drop(&mut self) {
        if self.owner {
            let _ = std::fs::remove_file(&self.fifo_path);
        }
    }
}

fn discover_fifo() -> Option<PathBuf> {
    let makeflags = std::env::var(MAKEFLAGS_VAR).ok()?;
    let auth = makeflags.split_whitespace().find(|s| s.starts_with(JOBSERVER_AUTH_PREFIX))?;
    let path = PathBuf::from(auth.trim_start_matches(JOBSERVER_AUTH_PREFIX));
    path.exists().then_some(path)
}

fn publish_makeflags(fifo_path: &Path) {
    let existing = std::env::var(MAKEFLAGS_VAR).unwrap_or_default();
    let auth = format!("{JOBSERVER_AUTH_PREFIX}{}", fifo_path.display());
    let combined = if existing.is_empty() {
        auth
    } else {
        format!("{existing} {auth}")
    };
    std::env::set_var(MAKEFLAGS_VAR, combined);
}

#[cfg(unix)]
fn create_fifo(path: &Path) -> Result<()> {
    use nix::sys::stat::Mode;
    nix::unistd::mkfifo(path, Mode::S_IRUSR | Mode::S_IWUSR).map_err(|e| FlowError::JobServerBroken {
        reason: format!("mkfifo {}: {e}", path.display()),
    })
}

#[cfg(not(unix))]
fn create_fifo(_path: &Path) -> Result<()> {
    Err(FlowError::JobServerBroken {
        reason: "jobserver FIFOs require a unix platform".to_string(),
    })
}

/// Try to read a single token byte without blocking past the attempt.
/// A FIFO with no writer-held tokens currently available returns
/// `Ok(false)`; the caller backs off and retries up to its own timeout.
#[cfg(unix)]
fn try_read_one(path: &Path) -> Result<bool> {
    let mut file = OpenOptions::new()
        .read(true)
        .custom_flags(libc_o_nonblock())
        .open(path)
        .map_err(|e| FlowError::JobServerBroken { reason: e.to_string() })?;

    let mut buf = [0u8; 1];
    match file.read(&mut buf) {
        Ok(1) => Ok(true),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(false),
        Err(e) => Err(FlowError::JobServerBroken { reason: e.to_string() }),
    }
}

#[cfg(not(unix))]
fn try_read_one(_path: &Path) -> Result<bool> {
    Ok(false)
}

#[cfg(unix)]
fn libc_o_nonblock() -> i32 {
    nix::fcntl::OFlag::O_NONBLOCK.bits()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn invalid_nproc_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(MAKEFLAGS_VAR);
        let err = JobServer::new(0, dir.path()).unwrap_err();
        assert!(matches!(err, FlowError::InvalidNproc { .. }));
    }

    #[tokio::test]
    async fn owner_creates_fifo_and_implicit_token_is_free() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(MAKEFLAGS_VAR);
        let js = JobServer::new(2, dir.path()).unwrap();
        assert!(js.is_owner());
        let _implicit = js.implicit_token();
        let makeflags = std::env::var(MAKEFLAGS_VAR).unwrap();
        assert!(makeflags.contains(JOBSERVER_AUTH_PREFIX));
        std::env::remove_var(MAKEFLAGS_VAR);
    }

    #[tokio::test]
    async fn acquire_and_release_roundtrip_token() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(MAKEFLAGS_VAR);
        let js = JobServer::new(2, dir.path()).unwrap();
        let token = js.acquire(Duration::from_secs(1)).await.unwrap();
        drop(token);
        // Releasing writes the byte back; a second acquire must succeed
        // within the same short timeout.
        let _token2 = js.acquire(Duration::from_secs(1)).await.unwrap();
        std::env::remove_var(MAKEFLAGS_VAR);
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(MAKEFLAGS_VAR);
        // nproc=1 means zero FIFO tokens are written (only the implicit
        // token exists), so any real acquire attempt must time out.
        let js = JobServer::new(1, dir.path()).unwrap();
        let err = js.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, FlowError::JobserverTimeout { .. }));
        std::env::remove_var(MAKEFLAGS_VAR);
    }

    #[tokio::test]
    async fn nested_instance_discovers_existing_fifo_as_participant() {
        let dir = tempfile::tempdir().unwrap();
        std::env::remove_var(MAKEFLAGS_VAR);
        let owner = JobServer::new(2, dir.path()).unwrap();
        let nested = JobServer::new(4, dir.path()).unwrap();
        assert!(!nested.is_owner());
        assert_eq!(nested.inner.fifo_path, owner.inner.fifo_path);
        std::env::remove_var(MAKEFLAGS_VAR);
    }
}
