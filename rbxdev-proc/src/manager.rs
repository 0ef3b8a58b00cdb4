//! Subprocess registry and shutdown coordinator.
//!
//! One [`ProcessManager`] exists per CLI invocation. Commands spawn their
//! long-running children through it and register cleanup hooks; on a
//! termination signal or when a command finishes, [`ProcessManager::cleanup`]
//! runs the hooks, asks every live process tree to terminate, and force-kills
//! whatever is still running when the deadline passes.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{OnceCell, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::platform::Platform;
use crate::tree::{ProcessTable, TreeSignal, kill_process_tree_blocking};

pub const DEFAULT_GRACEFUL_TIMEOUT: Duration = Duration::from_millis(3000);
pub const DEFAULT_CLEANUP_TIMEOUT: Duration = Duration::from_millis(5000);

/// Lines of combined stdout/stderr kept per captured process.
const CAPTURED_LINES: usize = 200;
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Not starting {0}: shutdown in progress")]
    ShuttingDown(String),

    #[error("Start of {0} was cancelled")]
    Cancelled(String),

    #[error("Failed to start {label}: {source}")]
    Spawn {
        label: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{0} started without a process id")]
    MissingPid(String),
}

pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Side effect run once during orchestrated shutdown, before any process is
/// terminated.
#[async_trait]
pub trait CleanupHook: Send + Sync {
    fn name(&self) -> &str {
        "cleanup hook"
    }

    async fn run(&self) -> Result<(), HookError>;
}

struct FnHook<F> {
    name: String,
    f: F,
}

#[async_trait]
impl<F, Fut> CleanupHook for FnHook<F>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(&self) -> Result<(), HookError> {
        (self.f)().await
    }
}

/// Wrap an async closure as a [`CleanupHook`].
pub fn hook_fn<F, Fut>(name: impl Into<String>, f: F) -> Arc<dyn CleanupHook>
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HookError>> + Send + 'static,
{
    Arc::new(FnHook {
        name: name.into(),
        f,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// How a tracked process ended.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal on unix.
    pub signal: Option<i32>,
}

impl ExitInfo {
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt as _;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Ended by SIGINT, SIGTERM or SIGKILL.
    pub fn by_termination_signal(&self) -> bool {
        #[cfg(unix)]
        {
            matches!(self.signal, Some(libc::SIGINT | libc::SIGTERM | libc::SIGKILL))
        }
        #[cfg(not(unix))]
        {
            false
        }
    }
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

type ExitReceiver = watch::Receiver<Option<ExitInfo>>;

async fn wait_exit(rx: &mut ExitReceiver) -> ExitInfo {
    loop {
        if let Some(info) = rx.borrow_and_update().clone() {
            return info;
        }
        if rx.changed().await.is_err() {
            return rx.borrow().clone().unwrap_or_default();
        }
    }
}

/// Tail of a captured process's stdout and stderr.
#[derive(Debug, Clone, Default)]
pub struct CapturedOutput(Arc<Mutex<VecDeque<String>>>);

impl CapturedOutput {
    fn push(&self, line: String) {
        let mut lines = lock(&self.0);
        if lines.len() == CAPTURED_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn lines(&self) -> Vec<String> {
        lock(&self.0).iter().cloned().collect()
    }
}

/// A subprocess under management.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    label: String,
    pid: u32,
    exit_rx: ExitReceiver,
    output: Option<CapturedOutput>,
}

impl ProcessHandle {
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_alive(&self) -> bool {
        self.exit_rx.borrow().is_none()
    }

    pub fn exit_info(&self) -> Option<ExitInfo> {
        self.exit_rx.borrow().clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.exit_info().and_then(|info| info.code)
    }

    /// Wait for the process to exit.
    pub async fn wait(&self) -> ExitInfo {
        let mut rx = self.exit_rx.clone();
        wait_exit(&mut rx).await
    }

    /// Captured output lines, when the process was spawned with capture.
    pub fn captured_output(&self) -> Vec<String> {
        self.output
            .as_ref()
            .map(CapturedOutput::lines)
            .unwrap_or_default()
    }

    fn with_output(mut self, output: Option<CapturedOutput>) -> Self {
        self.output = output;
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cancel: Option<CancellationToken>,
    /// Pipe stdout/stderr through us, echoing each line and keeping a tail.
    pub capture_output: bool,
}

impl SpawnOptions {
    pub fn captured() -> Self {
        Self {
            capture_output: true,
            ..Self::default()
        }
    }

    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// How long one process gets to exit after the terminate signal.
    pub graceful_timeout: Duration,
    /// Ceiling on the whole termination phase.
    pub cleanup_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            graceful_timeout: DEFAULT_GRACEFUL_TIMEOUT,
            cleanup_timeout: DEFAULT_CLEANUP_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoordinatorState {
    Idle,
    ShuttingDown,
    CleanupComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

struct Entry {
    label: String,
    generation: u64,
    exit_rx: ExitReceiver,
}

struct Inner {
    config: ManagerConfig,
    table: Arc<dyn ProcessTable>,
    processes: Mutex<HashMap<u32, Entry>>,
    hooks: Mutex<Vec<(HookId, Arc<dyn CleanupHook>)>>,
    next_id: AtomicU64,
    shutting_down: AtomicBool,
    cleanup_complete: AtomicBool,
    cleanup: OnceCell<()>,
    signals_installed: AtomicBool,
    signal_received: OnceLock<ShutdownSignal>,
    shutdown_requested: CancellationToken,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessManager")
            .field("config", &self.inner.config)
            .field("state", &self.state())
            .field("tracked", &self.tracked_pids())
            .finish()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new(ManagerConfig::default())
    }
}

impl ProcessManager {
    pub fn new(config: ManagerConfig) -> Self {
        Self::with_table(config, Platform::detect().process_table())
    }

    pub fn with_table(config: ManagerConfig, table: Arc<dyn ProcessTable>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                table,
                processes: Mutex::new(HashMap::new()),
                hooks: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
                shutting_down: AtomicBool::new(false),
                cleanup_complete: AtomicBool::new(false),
                cleanup: OnceCell::new(),
                signals_installed: AtomicBool::new(false),
                signal_received: OnceLock::new(),
                shutdown_requested: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> ManagerConfig {
        self.inner.config
    }

    pub fn table(&self) -> Arc<dyn ProcessTable> {
        Arc::clone(&self.inner.table)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutting_down.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> CoordinatorState {
        if self.inner.cleanup_complete.load(Ordering::SeqCst) {
            CoordinatorState::CleanupComplete
        } else if self.is_shutting_down() {
            CoordinatorState::ShuttingDown
        } else {
            CoordinatorState::Idle
        }
    }

    /// Cancelled when a termination signal arrives or [`Self::request_shutdown`] is called.
    pub fn shutdown_requested(&self) -> CancellationToken {
        self.inner.shutdown_requested.clone()
    }

    pub fn request_shutdown(&self) {
        self.inner.shutdown_requested.cancel();
    }

    /// The signal that started shutdown, if one did.
    pub fn signal_received(&self) -> Option<ShutdownSignal> {
        self.inner.signal_received.get().copied()
    }

    /// Whether an exit is a consequence of our own shutdown rather than a failure.
    pub fn is_expected_exit(&self, info: &ExitInfo) -> bool {
        self.is_shutting_down() || info.by_termination_signal()
    }

    pub fn tracked_pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = lock(&self.inner.processes).keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Spawn `command` and track it. Must be called inside a tokio runtime.
    pub fn spawn(
        &self,
        label: impl Into<String>,
        mut command: Command,
        options: SpawnOptions,
    ) -> Result<ProcessHandle, ManagerError> {
        let label = label.into();
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown(label));
        }
        if options.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
            return Err(ManagerError::Cancelled(label));
        }

        if options.capture_output {
            command.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        // Keep children out of the terminal's process group so Ctrl+C reaches
        // only us and teardown happens in order.
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn().map_err(|source| ManagerError::Spawn {
            label: label.clone(),
            source,
        })?;
        let Some(pid) = child.id() else {
            return Err(ManagerError::MissingPid(label));
        };

        let output = options.capture_output.then(CapturedOutput::default);
        let mut readers = Vec::new();
        if let Some(output) = &output {
            if let Some(stdout) = child.stdout.take() {
                readers.push(tokio::spawn(forward_lines(stdout, output.clone(), false)));
            }
            if let Some(stderr) = child.stderr.take() {
                readers.push(tokio::spawn(forward_lines(stderr, output.clone(), true)));
            }
        }

        let kill_token = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();
        let (exit_tx, exit_rx) = watch::channel(None);
        {
            let kill_token = kill_token.clone();
            let label = label.clone();
            tokio::spawn(async move {
                let status = tokio::select! {
                    status = child.wait() => status,
                    () = kill_token.cancelled() => {
                        debug!(pid, "Killing {label} after cancellation");
                        let _ = child.start_kill();
                        child.wait().await
                    }
                };
                let info = match status {
                    Ok(status) => ExitInfo::from_status(status),
                    Err(e) => {
                        warn!("Failed to wait for {label} (pid {pid}): {e}");
                        ExitInfo::default()
                    }
                };
                // Bounded: grandchildren may keep the pipes open.
                let drain = async {
                    for reader in readers {
                        let _ = reader.await;
                    }
                };
                if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
                    debug!(pid, "Output of {label} still open after exit");
                }
                let _ = exit_tx.send(Some(info));
            });
        }

        debug!(pid, "Spawned {label}");
        match self.register(label.clone(), pid, exit_rx) {
            Some(handle) => Ok(handle.with_output(output)),
            None => {
                kill_token.cancel();
                Err(ManagerError::ShuttingDown(label))
            }
        }
    }

    /// Track an already-running process whose exit is reported through `exit_rx`.
    ///
    /// Re-registering a pid replaces the earlier entry. Returns `None` once
    /// shutdown has begun.
    pub fn register(
        &self,
        label: impl Into<String>,
        pid: u32,
        exit_rx: watch::Receiver<Option<ExitInfo>>,
    ) -> Option<ProcessHandle> {
        let label = label.into();
        if self.is_shutting_down() {
            warn!(pid, "Ignoring registration of {label} during shutdown");
            return None;
        }

        let generation = self.next_id();
        lock(&self.inner.processes).insert(
            pid,
            Entry {
                label: label.clone(),
                generation,
                exit_rx: exit_rx.clone(),
            },
        );

        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let mut observer = exit_rx.clone();
        tokio::spawn(async move {
            let info = wait_exit(&mut observer).await;
            if let Some(inner) = weak.upgrade() {
                let mut processes = lock(&inner.processes);
                if processes
                    .get(&pid)
                    .is_some_and(|entry| entry.generation == generation)
                {
                    processes.remove(&pid);
                }
            }
            debug!(pid, "Tracked process exited ({info})");
        });

        Some(ProcessHandle {
            label,
            pid,
            exit_rx,
            output: None,
        })
    }

    /// Stop tracking `pid`; cleanup will leave it alone.
    pub fn unregister(&self, pid: u32) -> bool {
        lock(&self.inner.processes).remove(&pid).is_some()
    }

    pub fn register_cleanup_hook(&self, hook: Arc<dyn CleanupHook>) -> HookId {
        let id = HookId(self.next_id());
        lock(&self.inner.hooks).push((id, hook));
        id
    }

    pub fn unregister_cleanup_hook(&self, id: HookId) -> bool {
        let mut hooks = lock(&self.inner.hooks);
        let before = hooks.len();
        hooks.retain(|(hook_id, _)| *hook_id != id);
        hooks.len() != before
    }

    /// Run hooks, then terminate every tracked process. Runs at most once;
    /// concurrent and later callers wait for the same pass.
    pub async fn cleanup(&self) {
        let inner = Arc::clone(&self.inner);
        self.inner
            .cleanup
            .get_or_init(|| async move { run_cleanup(&inner).await })
            .await;
    }

    /// Listen for Ctrl+C and SIGTERM. The first one starts [`Self::cleanup`];
    /// exiting the process is left to the caller. Installing twice is a no-op.
    pub fn install_signal_handlers(&self) {
        if self.inner.signals_installed.swap(true, Ordering::SeqCst) {
            return;
        }

        let manager = self.clone();
        tokio::spawn(async move {
            let signal = wait_for_shutdown_signal().await;
            let _ = manager.inner.signal_received.set(signal);
            info!("Received {signal:?} signal, shutting down");
            manager.request_shutdown();
            manager.cleanup().await;
        });
    }
}

async fn forward_lines<R>(reader: R, output: CapturedOutput, stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        if stderr {
            eprintln!("{line}");
        } else {
            println!("{line}");
        }
        output.push(line);
    }
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> ShutdownSignal {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => tokio::select! {
            _ = ctrl_c() => ShutdownSignal::Interrupt,
            _ = sigterm.recv() => ShutdownSignal::Terminate,
        },
        Err(e) => {
            warn!("Failed to install SIGTERM handler: {e}");
            ctrl_c().await;
            ShutdownSignal::Interrupt
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> ShutdownSignal {
    ctrl_c().await;
    ShutdownSignal::Interrupt
}

async fn ctrl_c() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for Ctrl+C: {e}");
        std::future::pending::<()>().await;
    }
}

async fn run_cleanup(inner: &Arc<Inner>) {
    inner.shutting_down.store(true, Ordering::SeqCst);
    debug!("Cleanup started");

    let hooks: Vec<(HookId, Arc<dyn CleanupHook>)> = lock(&inner.hooks)
        .iter()
        .map(|(id, hook)| (*id, Arc::clone(hook)))
        .collect();
    for (_, hook) in hooks {
        let name = hook.name().to_string();
        match tokio::spawn(async move { hook.run().await }).await {
            Ok(Ok(())) => debug!("Cleanup hook '{name}' finished"),
            Ok(Err(e)) => warn!("Cleanup hook '{name}' failed: {e}"),
            Err(e) => warn!("Cleanup hook '{name}' panicked: {e}"),
        }
    }

    let live: Vec<(u32, String, ExitReceiver)> = lock(&inner.processes)
        .iter()
        .filter(|(_, entry)| entry.exit_rx.borrow().is_none())
        .map(|(pid, entry)| (*pid, entry.label.clone(), entry.exit_rx.clone()))
        .collect();

    if !live.is_empty() {
        let mut terminations = JoinSet::new();
        for (pid, label, exit_rx) in live.iter().cloned() {
            terminations.spawn(terminate_gracefully(
                Arc::clone(&inner.table),
                pid,
                label,
                exit_rx,
                inner.config.graceful_timeout,
            ));
        }

        let all_done = async { while terminations.join_next().await.is_some() {} };
        if tokio::time::timeout(inner.config.cleanup_timeout, all_done)
            .await
            .is_err()
        {
            warn!(
                "Cleanup did not finish within {:?}; force-killing remaining processes",
                inner.config.cleanup_timeout
            );
            terminations.abort_all();
            for (pid, label, exit_rx) in &live {
                if exit_rx.borrow().is_none() {
                    force_kill(Arc::clone(&inner.table), *pid, label).await;
                }
            }
        }
    }

    inner.cleanup_complete.store(true, Ordering::SeqCst);
    debug!("Cleanup complete");
}

async fn terminate_gracefully(
    table: Arc<dyn ProcessTable>,
    pid: u32,
    label: String,
    mut exit_rx: ExitReceiver,
    graceful_timeout: Duration,
) {
    debug!(pid, "Stopping {label}");
    if let Err(e) = kill_process_tree_blocking(Arc::clone(&table), pid, TreeSignal::Terminate).await {
        warn!("Failed to stop {label} (pid {pid}): {e}");
    }

    if tokio::time::timeout(graceful_timeout, wait_exit(&mut exit_rx))
        .await
        .is_err()
    {
        warn!(
            "{label} (pid {pid}) did not exit within {:?}, force-killing",
            graceful_timeout
        );
        force_kill(table, pid, &label).await;
    }
}

async fn force_kill(table: Arc<dyn ProcessTable>, pid: u32, label: &str) {
    if let Err(e) = kill_process_tree_blocking(table, pid, TreeSignal::Kill).await {
        warn!("Failed to force-kill {label} (pid {pid}): {e}");
    }
}
