use std::path::{Path, PathBuf};

use super::session::{run_to_completion, script_command};
use super::{CommandResult, Context};
use crate::output;
use crate::rojo;

pub async fn run(ctx: &Context, output: Option<PathBuf>) -> CommandResult {
    let place = build_place(ctx, output.as_deref()).await?;
    output::success(&format!("Built {}", place.display()));
    Ok(())
}

/// Compile (rbxts), build the place with rojo, then run typegen if enabled.
pub async fn build_place(ctx: &Context, output: Option<&Path>) -> CommandResult<PathBuf> {
    let config = &ctx.config;
    let place = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| config.output.clone());

    if config.is_rbxts() {
        match config.script("build") {
            Some(script) => {
                output::step("Compiling TypeScript");
                run_to_completion(ctx, "build script", script_command(script, &config.root))
                    .await?;
            }
            None => output::warning(
                "No [scripts] build command configured; building the last compiled sources",
            ),
        }
    }

    if let Some(parent) = place.parent() {
        std::fs::create_dir_all(parent)?;
    }
    output::step(&format!("Building {}", output::emphasized(&place.display().to_string())));
    run_to_completion(ctx, "rojo build", rojo::build_command(config, &place)).await?;

    if let Some(types) = &config.typegen_output {
        match config.script("typegen") {
            Some(script) => {
                output::step("Generating types");
                let mut command = script_command(script, &config.root);
                command.env("RBXDEV_TYPEGEN_OUTPUT", types);
                run_to_completion(ctx, "typegen script", command).await?;
            }
            None => output::warning(
                "typegen is enabled but no [scripts] typegen command is configured",
            ),
        }
    }

    Ok(place)
}
