use super::session::{self, race};
use super::{CommandResult, Context, build, open, watch};
use crate::output;

pub async fn run(ctx: &Context, port: Option<u16>) -> CommandResult {
    let place = build::build_place(ctx, None).await?;
    session::claim_background_tasks(ctx).await?;
    let handles = watch::start_watchers(ctx, port).await?;
    let studio = open::launch_studio(ctx, &place).await?;
    output::muted("Close the place in Studio or press Ctrl+C to stop");

    let end = race(ctx, &handles, Some(studio)).await;
    session::conclude(ctx, end).await
}
