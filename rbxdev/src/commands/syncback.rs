use std::path::{Path, PathBuf};

use rbxdev_proc::cleanup_lock;

use super::session::run_to_completion;
use super::{CommandError, CommandResult, Context, blocking};
use crate::output;
use crate::paths;
use crate::rojo;
use crate::studio::{self, PlaceLock};

pub async fn run(ctx: &Context, input: Option<PathBuf>, force: bool) -> CommandResult {
    let input = input.unwrap_or_else(|| ctx.config.output.clone());
    ensure_place_closed(ctx, &input, force).await?;
    sync(ctx, &input).await
}

/// Write changes made in `place` back to the project sources.
pub async fn sync(ctx: &Context, place: &Path) -> CommandResult {
    if !place.exists() {
        return Err(CommandError::MissingPlace(place.to_path_buf()));
    }
    output::step(&format!(
        "Syncing {} back to the project",
        output::emphasized(&place.display().to_string())
    ));
    run_to_completion(ctx, "rojo syncback", rojo::syncback_command(&ctx.config, place)).await?;
    output::success("Syncback complete");
    Ok(())
}

/// Refuse while Studio holds `place` open, since its next save would undo the sync.
async fn ensure_place_closed(ctx: &Context, place: &Path, force: bool) -> CommandResult {
    let lock_path = paths::studio_lock_path(place);
    let platform = ctx.studio_platform;
    let running = blocking(move || studio::find_studio_pids(platform)).await?;
    match studio::place_lock_state(&lock_path, &running) {
        PlaceLock::Free => Ok(()),
        PlaceLock::Stale => {
            cleanup_lock(&lock_path).await;
            Ok(())
        }
        PlaceLock::Held if force => {
            output::warning("Studio has this place open; syncing anyway (--force)");
            Ok(())
        }
        PlaceLock::Held => Err(CommandError::PlaceOpen(place.to_path_buf())),
    }
}
