//! `rojo` invocations and the server lock that records a running `rojo serve`.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use rbxdev_proc::{
    Liveness, ProcessHandle, ProcessTable, TreeSignal, cleanup_lock, is_alive_blocking,
    kill_process_tree_blocking, read_server_lock,
};
use tokio::process::Command;
use tracing::{info, warn};

use crate::commands::{CommandResult, blocking};
use crate::config::ResolvedConfig;
use crate::paths;

/// Attempts tried past the configured port before giving up.
pub const PORT_SEARCH_ATTEMPTS: u16 = 10;

const STOP_POLL: Duration = Duration::from_millis(100);
const STOP_GRACE: Duration = Duration::from_secs(3);
const BIND_POLL: Duration = Duration::from_millis(100);

/// How long `rojo serve` gets to bind its port before the lock is written anyway.
pub const BIND_TIMEOUT: Duration = Duration::from_secs(3);

fn rojo() -> Command {
    Command::new(paths::rojo_executable())
}

pub fn serve_command(config: &ResolvedConfig, port: u16) -> Command {
    let mut command = rojo();
    command
        .arg("serve")
        .arg(&config.rojo_project)
        .arg("--port")
        .arg(port.to_string())
        .current_dir(&config.root);
    command
}

pub fn build_command(config: &ResolvedConfig, output: &Path) -> Command {
    let mut command = rojo();
    command
        .arg("build")
        .arg(&config.rojo_project)
        .arg("-o")
        .arg(output)
        .current_dir(&config.root);
    command
}

pub fn syncback_command(config: &ResolvedConfig, input: &Path) -> Command {
    let mut command = rojo();
    command
        .arg("syncback")
        .arg(&config.syncback_project)
        .arg("--input")
        .arg(input)
        .current_dir(&config.root);
    command
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32, port: u16 },
}

/// Stop the server recorded in `lock_path`, if that record is still live.
///
/// Stale records are removed by the read. A live server's process tree is
/// asked to terminate, then killed if it is still around after a short grace
/// period, and the lock is deleted.
pub async fn stop_existing_server(
    lock_path: &Path,
    liveness: Arc<dyn Liveness>,
    table: Arc<dyn ProcessTable>,
) -> CommandResult<StopOutcome> {
    let path = lock_path.to_path_buf();
    let Some(lock) = blocking(move || read_server_lock(&path, liveness.as_ref())).await? else {
        return Ok(StopOutcome::NotRunning);
    };

    info!(
        pid = lock.pid,
        port = lock.port,
        "Stopping existing rojo server"
    );
    kill_process_tree_blocking(Arc::clone(&table), lock.pid, TreeSignal::Terminate).await?;

    let mut waited = Duration::ZERO;
    while is_alive_blocking(Arc::clone(&table), lock.pid).await && waited < STOP_GRACE {
        tokio::time::sleep(STOP_POLL).await;
        waited += STOP_POLL;
    }
    if is_alive_blocking(Arc::clone(&table), lock.pid).await {
        warn!(
            "rojo server (pid {}) ignored the stop request, killing it",
            lock.pid
        );
        kill_process_tree_blocking(table, lock.pid, TreeSignal::Kill).await?;
    }

    cleanup_lock(lock_path).await;
    Ok(StopOutcome::Stopped {
        pid: lock.pid,
        port: lock.port,
    })
}

/// Wait for `server` to bind `port`. Gives up when the server exits or after
/// `timeout`; returns whether the port was seen bound.
pub async fn wait_until_listening(
    liveness: Arc<dyn Liveness>,
    server: &ProcessHandle,
    port: u16,
    timeout: Duration,
) -> CommandResult<bool> {
    let mut waited = Duration::ZERO;
    loop {
        let check = Arc::clone(&liveness);
        if !blocking(move || check.is_port_available(port)).await? {
            return Ok(true);
        }
        if !server.is_alive() || waited >= timeout {
            return Ok(false);
        }
        tokio::time::sleep(BIND_POLL).await;
        waited += BIND_POLL;
    }
}
