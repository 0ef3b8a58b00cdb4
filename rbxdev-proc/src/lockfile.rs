//! Plain-text lock records.
//!
//! Every lock is a newline-delimited text file that is opened, read or
//! written, and closed again. Nothing holds a lock file open, because the
//! application that contends for them (Studio) is outside our control.

use std::fmt::Display;
use std::future::Future;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::probe::Liveness;

const DEFAULT_REMOVE_ATTEMPTS: u32 = 5;
const DEFAULT_REMOVE_BASE_DELAY: Duration = Duration::from_millis(100);

#[cfg(windows)]
const BUSY_OS_CODES: &[i32] = &[32, 33]; // ERROR_SHARING_VIOLATION, ERROR_LOCK_VIOLATION
#[cfg(unix)]
const BUSY_OS_CODES: &[i32] = &[libc::EBUSY];
#[cfg(not(any(unix, windows)))]
const BUSY_OS_CODES: &[i32] = &[];

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to write lock file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove lock file {path}: {source}")]
    Remove {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Write `fields` one per line, replacing the whole file.
pub fn write_lock<I, T>(path: &Path, fields: I) -> Result<(), LockError>
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    let mut contents = String::new();
    for field in fields {
        contents.push_str(&field.to_string());
        contents.push('\n');
    }

    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|source| LockError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    }

    std::fs::write(path, contents).map_err(|source| LockError::Write {
        path: path.to_path_buf(),
        source,
    })
}

/// Non-empty, trimmed lines of a lock file, or `None` if it cannot be read.
pub fn read_lock_raw(path: &Path) -> Option<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Some(
            contents
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        ),
        Err(e) if e.kind() == ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Failed to read lock file {}: {e}", path.display());
            None
        }
    }
}

/// Ownership record of a running `rojo serve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerLock {
    pub pid: u32,
    pub port: u16,
    /// Epoch milliseconds; 0 when the record did not carry one.
    pub start_time_ms: u64,
}

impl ServerLock {
    pub fn new(pid: u32, port: u16) -> Self {
        Self {
            pid,
            port,
            start_time_ms: epoch_millis(),
        }
    }

    pub fn parse(lines: &[String]) -> Option<Self> {
        let pid = lines.first()?.parse::<u32>().ok()?;
        let port = lines.get(1)?.parse::<u16>().ok()?;
        let start_time_ms = lines
            .get(2)
            .and_then(|t| t.parse::<u64>().ok())
            .unwrap_or(0);
        Some(Self {
            pid,
            port,
            start_time_ms,
        })
    }

    /// A record is live only if its process runs and its port is still bound.
    ///
    /// The port check catches a recycled pid that now belongs to something else.
    pub fn is_live(&self, liveness: &dyn Liveness) -> bool {
        liveness.is_process_alive(self.pid) && !liveness.is_port_available(self.port)
    }
}

pub fn write_server_lock(path: &Path, lock: &ServerLock) -> Result<(), LockError> {
    write_lock(
        path,
        [
            lock.pid.to_string(),
            lock.port.to_string(),
            lock.start_time_ms.to_string(),
        ],
    )
}

/// Read and validate a server lock, deleting it if it is stale or malformed.
pub fn read_server_lock(path: &Path, liveness: &dyn Liveness) -> Option<ServerLock> {
    let lines = read_lock_raw(path)?;

    let Some(lock) = ServerLock::parse(&lines) else {
        warn!("Ignoring malformed server lock {}", path.display());
        remove_quietly(path);
        return None;
    };

    if !lock.is_live(liveness) {
        info!(
            pid = lock.pid,
            port = lock.port,
            "Removing stale server lock {}",
            path.display()
        );
        remove_quietly(path);
        return None;
    }

    Some(lock)
}

fn remove_quietly(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove lock file {}: {e}", path.display()),
    }
}

/// Bounded exponential backoff for deleting a busy lock file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_REMOVE_ATTEMPTS,
            base_delay: DEFAULT_REMOVE_BASE_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `retry`-th failed attempt (0-based): base, 2x base, 4x base...
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(retry.min(16)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CleanupOutcome {
    Removed,
    AlreadyGone,
    /// Retries were exhausted; the user was told to delete the file.
    GaveUp,
}

pub fn is_busy(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::ResourceBusy
        || err
            .raw_os_error()
            .is_some_and(|code| BUSY_OS_CODES.contains(&code))
}

/// Delete a lock file, retrying while the OS reports it busy.
pub async fn cleanup_lock(path: &Path) -> CleanupOutcome {
    cleanup_lock_with(
        path,
        RetryPolicy::default(),
        |p| std::fs::remove_file(p),
        tokio::time::sleep,
    )
    .await
}

/// [`cleanup_lock`] with an injected remover and timer.
pub async fn cleanup_lock_with<R, S, F>(
    path: &Path,
    policy: RetryPolicy,
    mut remove: R,
    mut sleep: S,
) -> CleanupOutcome
where
    R: FnMut(&Path) -> std::io::Result<()>,
    S: FnMut(Duration) -> F,
    F: Future<Output = ()>,
{
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        match remove(path) {
            Ok(()) => {
                debug!("Removed lock file {}", path.display());
                return CleanupOutcome::Removed;
            }
            Err(e) if e.kind() == ErrorKind::NotFound => return CleanupOutcome::AlreadyGone,
            Err(e) if is_busy(&e) => {
                last_error = Some(e);
                if attempt + 1 < attempts {
                    let delay = policy.delay_for(attempt);
                    debug!(
                        attempt = attempt + 1,
                        ?delay,
                        "Lock file {} is busy, retrying",
                        path.display()
                    );
                    sleep(delay).await;
                }
            }
            Err(e) => {
                last_error = Some(e);
                break;
            }
        }
    }

    let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
    warn!(
        "Could not remove lock file {} ({reason}). Delete it manually once the program holding it has exited.",
        path.display()
    );
    CleanupOutcome::GaveUp
}

/// A lock file shared by several background tasks, one pid per line.
#[derive(Debug, Clone)]
pub struct SharedLock {
    path: PathBuf,
}

impl SharedLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pids(&self) -> Vec<u32> {
        read_lock_raw(&self.path)
            .unwrap_or_default()
            .iter()
            .filter_map(|line| line.parse::<u32>().ok())
            .collect()
    }

    pub fn add(&self, pid: u32) -> Result<(), LockError> {
        let mut pids = self.pids();
        if !pids.contains(&pid) {
            pids.push(pid);
        }
        write_lock(&self.path, pids)
    }

    /// Remove `pid`; the file is deleted once no pids remain.
    pub fn remove(&self, pid: u32) -> Result<(), LockError> {
        let pids: Vec<u32> = self.pids().into_iter().filter(|p| *p != pid).collect();
        self.store(&pids)
    }

    /// Drop pids that are no longer running and return the survivors.
    pub fn prune(&self, liveness: &dyn Liveness) -> Result<Vec<u32>, LockError> {
        let pids: Vec<u32> = self
            .pids()
            .into_iter()
            .filter(|pid| liveness.is_process_alive(*pid))
            .collect();
        self.store(&pids)?;
        Ok(pids)
    }

    fn store(&self, pids: &[u32]) -> Result<(), LockError> {
        if !pids.is_empty() {
            return write_lock(&self.path, pids);
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(LockError::Remove {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

fn epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
