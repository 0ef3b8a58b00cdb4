//! Studio lockfile watching.
//!
//! Studio creates `<place>.lock` next to a place file while the place is open
//! and removes it on close. [`LockWatcher`] turns that side effect into a
//! single awaitable that resolves once the place has been closed.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{RecursiveMode, Watcher};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::probe::Liveness;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DEBOUNCE: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    Waiting,
    Open,
    Closed,
}

/// Advance the watch state machine.
///
/// `owner_alive` is `None` when no owner process is being tracked. An owner
/// that exits before the lock ever appears counts as a close; once the lock
/// has appeared only its removal closes it.
pub fn next_state(state: LockState, lock_exists: bool, owner_alive: Option<bool>) -> LockState {
    let owner_gone = owner_alive == Some(false);
    match state {
        LockState::Waiting if lock_exists => LockState::Open,
        LockState::Waiting if owner_gone => LockState::Closed,
        LockState::Waiting => LockState::Waiting,
        LockState::Open if !lock_exists => LockState::Closed,
        LockState::Open => LockState::Open,
        LockState::Closed => LockState::Closed,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockWatchOutcome {
    /// Whether the lock was ever observed.
    pub opened: bool,
}

#[derive(Debug, Error)]
pub enum LockWatchError {
    #[error("Shutdown")]
    Shutdown,
}

type OpenCallback = Box<dyn FnOnce() + Send>;

pub struct LockWatcher {
    path: PathBuf,
    on_open: Option<OpenCallback>,
    owner: Option<(u32, Arc<dyn Liveness>)>,
    cancel: Option<CancellationToken>,
    poll_interval: Duration,
    listen_ctrl_c: bool,
}

impl LockWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            on_open: None,
            owner: None,
            cancel: None,
            poll_interval: DEFAULT_POLL_INTERVAL,
            listen_ctrl_c: true,
        }
    }

    /// Called once, when the lock is first seen (immediately if it already exists).
    pub fn on_open(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_open = Some(Box::new(f));
        self
    }

    /// Treat the exit of `pid` as a close.
    pub fn owner_pid(mut self, pid: u32, liveness: Arc<dyn Liveness>) -> Self {
        self.owner = Some((pid, liveness));
        self
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Fallback re-check interval for missed filesystem events.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn listen_ctrl_c(mut self, listen: bool) -> Self {
        self.listen_ctrl_c = listen;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait until the lock is removed or its owner exits.
    pub async fn wait(self) -> Result<LockWatchOutcome, LockWatchError> {
        let LockWatcher {
            path,
            mut on_open,
            owner,
            cancel,
            poll_interval,
            listen_ctrl_c,
        } = self;

        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let _watcher = match start_watch(&path, events_tx) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                warn!(
                    "Could not watch {}; falling back to polling: {e}",
                    path.display()
                );
                None
            }
        };

        let cancel = cancel.unwrap_or_default();
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);
        let mut ctrl_c_armed = listen_ctrl_c;

        let mut state = LockState::Waiting;
        let mut opened = false;
        loop {
            let exists = lock_exists(&path);
            let owner_alive = match &owner {
                Some((pid, liveness)) if state == LockState::Waiting && !exists => {
                    Some(owner_is_alive(*pid, Arc::clone(liveness)).await)
                }
                _ => None,
            };
            let next = next_state(state, exists, owner_alive);
            if next != state {
                debug!(from = ?state, to = ?next, "Lock {}", path.display());
            }
            state = next;

            match state {
                LockState::Open if !opened => {
                    opened = true;
                    if let Some(on_open) = on_open.take() {
                        on_open();
                    }
                }
                LockState::Closed => return Ok(LockWatchOutcome { opened }),
                _ => {}
            }

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(LockWatchError::Shutdown),
                result = &mut ctrl_c, if ctrl_c_armed => match result {
                    Ok(()) => return Err(LockWatchError::Shutdown),
                    Err(e) => {
                        warn!("Failed to listen for Ctrl+C: {e}");
                        ctrl_c_armed = false;
                    }
                },
                Some(()) = events_rx.recv() => {}
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }
}

async fn owner_is_alive(pid: u32, liveness: Arc<dyn Liveness>) -> bool {
    tokio::task::spawn_blocking(move || liveness.is_process_alive(pid))
        .await
        .unwrap_or(false)
}

fn lock_exists(path: &Path) -> bool {
    match path.try_exists() {
        Ok(exists) => exists,
        Err(e) => {
            warn!("Could not check {}: {e}", path.display());
            false
        }
    }
}

/// Watch the lock's directory (non-recursive); every event is a hint to re-check.
fn start_watch(
    path: &Path,
    events: mpsc::UnboundedSender<()>,
) -> notify::Result<Debouncer<notify::RecommendedWatcher>> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
        match result {
            Ok(_) => {
                let _ = events.send(());
            }
            Err(e) => warn!("Lock watch error: {e:?}"),
        }
    })?;
    debouncer.watcher().watch(&dir, RecursiveMode::NonRecursive)?;
    Ok(debouncer)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::sync::oneshot;

    use super::*;

    struct OwnerGone;

    impl Liveness for OwnerGone {
        fn is_process_alive(&self, _pid: u32) -> bool {
            false
        }

        fn is_port_available(&self, _port: u16) -> bool {
            true
        }
    }

    fn watcher(path: &Path) -> LockWatcher {
        LockWatcher::new(path)
            .poll_interval(Duration::from_millis(20))
            .listen_ctrl_c(false)
    }

    #[test]
    fn state_transitions() {
        use LockState::*;

        assert_eq!(next_state(Waiting, false, None), Waiting);
        assert_eq!(next_state(Waiting, false, Some(true)), Waiting);
        assert_eq!(next_state(Waiting, true, None), Open);
        assert_eq!(next_state(Waiting, false, Some(false)), Closed);
        assert_eq!(next_state(Open, true, Some(true)), Open);
        assert_eq!(next_state(Open, false, None), Closed);
        assert_eq!(next_state(Open, true, Some(false)), Open);
        assert_eq!(next_state(Closed, true, Some(true)), Closed);
    }

    #[tokio::test]
    async fn resolves_after_open_then_close() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("game.rbxl.lock");
        let (opened_tx, opened_rx) = oneshot::channel();

        let task = tokio::spawn(
            watcher(&lock)
                .on_open(move || {
                    let _ = opened_tx.send(());
                })
                .wait(),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::write(&lock, "4242").unwrap();
        tokio::time::timeout(Duration::from_secs(5), opened_rx)
            .await
            .expect("on_open should fire")
            .unwrap();

        std::fs::remove_file(&lock).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("watch should resolve")
            .unwrap()
            .unwrap();
        assert!(outcome.opened);
    }

    #[tokio::test]
    async fn existing_lock_fires_on_open_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("game.rbxl.lock");
        std::fs::write(&lock, "").unwrap();

        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let task = tokio::spawn(
            watcher(&lock)
                .on_open(move || flag.store(true, Ordering::SeqCst))
                .wait(),
        );

        for _ in 0..100 {
            if fired.load(Ordering::SeqCst) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(fired.load(Ordering::SeqCst));

        std::fs::remove_file(&lock).unwrap();
        let outcome = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("watch should resolve")
            .unwrap()
            .unwrap();
        assert!(outcome.opened);
    }

    #[tokio::test]
    async fn owner_exit_without_lock_counts_as_close() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("game.rbxl.lock");

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            watcher(&lock).owner_pid(99_999, Arc::new(OwnerGone)).wait(),
        )
        .await
        .expect("watch should resolve")
        .unwrap();
        assert_eq!(outcome, LockWatchOutcome { opened: false });
    }

    #[tokio::test]
    async fn cancellation_is_reported_as_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("game.rbxl.lock");
        let token = CancellationToken::new();

        let task = tokio::spawn(watcher(&lock).cancel_on(token.clone()).wait());
        tokio::time::sleep(Duration::from_millis(30)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("watch should stop")
            .unwrap();
        assert!(matches!(result, Err(LockWatchError::Shutdown)));
    }

    #[tokio::test]
    async fn missing_directory_falls_back_to_polling() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("not-yet").join("game.rbxl.lock");

        let outcome = tokio::time::timeout(
            Duration::from_secs(5),
            watcher(&lock).owner_pid(1, Arc::new(OwnerGone)).wait(),
        )
        .await
        .expect("watch should resolve")
        .unwrap();
        assert!(!outcome.opened);
    }
}
