use std::sync::Arc;

use rbxdev_proc::{
    HookError, ProcessHandle, ServerLock, cleanup_lock, find_available_port, hook_fn,
    write_server_lock,
};
use tracing::warn;

use super::session::{self, race};
use super::{CommandResult, Context};
use crate::output;
use crate::rojo::{self, StopOutcome};

pub async fn run(ctx: &Context, port: Option<u16>) -> CommandResult {
    let server = start_server(ctx, port).await?;
    let end = race(ctx, &[server], None).await;
    session::conclude(ctx, end).await
}

/// Replace any recorded server with a fresh `rojo serve` and record it once
/// it is listening.
///
/// The lock is removed again by a cleanup hook.
pub async fn start_server(ctx: &Context, port: Option<u16>) -> CommandResult<ProcessHandle> {
    let lock_path = ctx.config.server_lock_path();

    let stopped =
        rojo::stop_existing_server(&lock_path, Arc::clone(&ctx.liveness), ctx.table()).await?;
    if let StopOutcome::Stopped { pid, port } = stopped {
        output::warning(&format!(
            "Stopped a rojo server that was still running (pid {pid}, port {port})"
        ));
    }

    let preferred = port.unwrap_or(ctx.config.port);
    let port = find_available_port(preferred, rojo::PORT_SEARCH_ATTEMPTS)?;
    if port != preferred {
        output::warning(&format!("Port {preferred} is busy, using {port}"));
    }

    let server = session::spawn(ctx, "rojo serve", rojo::serve_command(&ctx.config, port))?;
    {
        let path = lock_path.clone();
        ctx.manager
            .register_cleanup_hook(hook_fn("remove server lock", move || {
                let path = path.clone();
                async move {
                    cleanup_lock(&path).await;
                    Ok::<(), HookError>(())
                }
            }));
    }

    let bound =
        rojo::wait_until_listening(Arc::clone(&ctx.liveness), &server, port, rojo::BIND_TIMEOUT)
            .await?;
    if !server.is_alive() || ctx.manager.is_shutting_down() {
        // The race reports how the session ended.
        return Ok(server);
    }
    if !bound {
        warn!(port, "rojo serve has not bound its port yet");
    }
    write_server_lock(&lock_path, &ServerLock::new(server.pid(), port))?;

    output::success(&format!("rojo serving on port {port}"));
    Ok(server)
}
