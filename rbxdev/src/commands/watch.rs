use rbxdev_proc::ProcessHandle;

use super::session::{self, race};
use super::{CommandResult, Context, serve};
use crate::output;

pub async fn run(ctx: &Context, port: Option<u16>) -> CommandResult {
    session::claim_background_tasks(ctx).await?;
    let handles = start_watchers(ctx, port).await?;
    output::muted("Press Ctrl+C to stop");
    let end = race(ctx, &handles, None).await;
    session::conclude(ctx, end).await
}

/// The project's watch script (if any) and a `rojo serve`.
pub async fn start_watchers(
    ctx: &Context,
    port: Option<u16>,
) -> CommandResult<Vec<ProcessHandle>> {
    let mut handles = Vec::new();
    match ctx.config.script("watch") {
        Some(script) => handles.push(session::spawn_script(ctx, "watch", script)?),
        None if ctx.config.is_rbxts() => output::warning(
            "No [scripts] watch command configured; TypeScript changes will not be recompiled",
        ),
        None => {}
    }
    handles.push(serve::start_server(ctx, port).await?);
    Ok(handles)
}
