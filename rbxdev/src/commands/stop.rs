use std::sync::Arc;
use std::time::Duration;

use rbxdev_proc::{ProcessTable, SharedLock, TreeSignal};
use tracing::warn;

use super::{CommandResult, Context, blocking};
use crate::output;
use crate::rojo::{self, StopOutcome};

const SESSION_EXIT_WAIT: Duration = Duration::from_secs(6);
const SESSION_POLL: Duration = Duration::from_millis(100);

pub async fn run(ctx: &Context) -> CommandResult {
    let stopped_sessions = stop_sessions(ctx).await?;

    let lock_path = ctx.config.server_lock_path();
    match rojo::stop_existing_server(&lock_path, Arc::clone(&ctx.liveness), ctx.table()).await? {
        StopOutcome::Stopped { pid, port } => {
            output::success(&format!("Stopped rojo server (pid {pid}, port {port})"));
        }
        StopOutcome::NotRunning if stopped_sessions == 0 => {
            output::muted("No rojo server is running");
        }
        StopOutcome::NotRunning => {}
    }
    Ok(())
}

/// Ask other rbxdev sessions recorded for this place to shut down and wait
/// for them; each one cleans up its own processes and locks.
async fn stop_sessions(ctx: &Context) -> CommandResult<usize> {
    let lock = SharedLock::new(ctx.config.tasks_lock_path());
    let me = std::process::id();
    let liveness = Arc::clone(&ctx.liveness);
    let sessions: Vec<u32> = blocking(move || lock.prune(liveness.as_ref()))
        .await??
        .into_iter()
        .filter(|pid| *pid != me)
        .collect();
    if sessions.is_empty() {
        return Ok(0);
    }

    let table = ctx.table();
    {
        let table = Arc::clone(&table);
        let sessions = sessions.clone();
        blocking(move || {
            sessions
                .iter()
                .try_for_each(|&pid| table.send_signal(pid, TreeSignal::Terminate).map(drop))
        })
        .await??;
    }

    let mut waited = Duration::ZERO;
    let mut running = still_running(&table, &sessions).await?;
    while !running.is_empty() && waited < SESSION_EXIT_WAIT {
        tokio::time::sleep(SESSION_POLL).await;
        waited += SESSION_POLL;
        running = still_running(&table, &sessions).await?;
    }
    for &pid in &sessions {
        if running.contains(&pid) {
            warn!("rbxdev session (pid {pid}) is still shutting down");
        } else {
            output::success(&format!("Stopped rbxdev session (pid {pid})"));
        }
    }
    Ok(sessions.len())
}

async fn still_running(table: &Arc<dyn ProcessTable>, pids: &[u32]) -> CommandResult<Vec<u32>> {
    let table = Arc::clone(table);
    let pids = pids.to_vec();
    blocking(move || pids.into_iter().filter(|pid| table.is_alive(*pid)).collect()).await
}
