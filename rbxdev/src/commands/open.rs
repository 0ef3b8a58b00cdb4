use std::path::Path;
use std::sync::Arc;

use rbxdev_proc::{HookError, LockWatcher, SpawnOptions, cleanup_lock, hook_fn};
use tracing::{debug, info};

use super::session::{self, SessionEnd, StudioWatch, race};
use super::{CommandResult, Context, blocking, build, syncback};
use crate::output;
use crate::paths;
use crate::studio::{self, PlaceLock};

pub async fn run(ctx: &Context) -> CommandResult {
    let place = build::build_place(ctx, None).await?;
    let studio = launch_studio(ctx, &place).await?;
    output::muted("Waiting for Studio to close the place");

    let end = race(ctx, &[], Some(studio)).await;
    if matches!(end, SessionEnd::StudioClosed { opened: true }) && ctx.config.syncback_on_close {
        syncback::sync(ctx, &place).await?;
    }
    session::conclude(ctx, end).await
}

/// Open `place` in Studio and return a watch that resolves when Studio
/// closes it.
///
/// The launcher stays registered with the manager only until the place is
/// open, so an interrupt before that point kills it and an interrupt after
/// leaves Studio running.
pub async fn launch_studio(ctx: &Context, place: &Path) -> CommandResult<StudioWatch> {
    let lock_path = paths::studio_lock_path(place);
    let watcher = LockWatcher::new(&lock_path).cancel_on(ctx.manager.shutdown_requested());

    let platform = ctx.studio_platform;
    let running = blocking(move || studio::find_studio_pids(platform)).await?;
    match studio::place_lock_state(&lock_path, &running) {
        PlaceLock::Held => {
            output::warning("Studio already has this place open; waiting for it to close");
            return Ok(Box::pin(watcher.wait()));
        }
        PlaceLock::Stale => {
            info!("Removing Studio lock left by a previous session");
            cleanup_lock(&lock_path).await;
        }
        PlaceLock::Free => {}
    }

    let command = studio::launch_command(ctx.studio_platform, place)?;
    let launcher = ctx
        .manager
        .spawn("Roblox Studio", command, SpawnOptions::default())?;
    let pid = launcher.pid();
    output::step("Opening the place in Roblox Studio");

    // Studio started through a launcher (macOS `open`) is not in the
    // launcher's tree; stop the new instance directly until the place opens.
    let stop_hook = ctx
        .manager
        .register_cleanup_hook(hook_fn("stop Roblox Studio", move || {
            let before = running.clone();
            async move {
                let stopped = tokio::task::spawn_blocking(move || {
                    let now = studio::find_studio_pids(platform);
                    studio::stop_launched(platform.process_table().as_ref(), &before, &now)
                })
                .await??;
                if !stopped.is_empty() {
                    debug!(?stopped, "Stopped Roblox Studio before it opened the place");
                }
                Ok::<(), HookError>(())
            }
        }));

    let manager = ctx.manager.clone();
    let watcher = watcher
        .owner_pid(pid, Arc::clone(&ctx.liveness))
        .on_open(move || {
            manager.unregister(pid);
            manager.unregister_cleanup_hook(stop_hook);
            info!("Studio opened the place");
        });
    Ok(Box::pin(watcher.wait()))
}
