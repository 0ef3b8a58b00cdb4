//! Shared plumbing for commands that run long-lived processes side by side.

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use rbxdev_proc::{
    ExitInfo, HookError, LockWatchError, LockWatchOutcome, ProcessHandle, SharedLock,
    SpawnOptions, hook_fn,
};
use tokio::process::Command;
use tokio::task::JoinSet;
use tracing::debug;

use super::{CommandError, CommandResult, Context, blocking};
use crate::output;

pub type StudioWatch =
    Pin<Box<dyn Future<Output = Result<LockWatchOutcome, LockWatchError>> + Send>>;

/// A shell command line from `[scripts]`, run from the project root.
pub fn script_command(script: &str, cwd: &Path) -> Command {
    let mut command = if cfg!(windows) {
        let mut command = Command::new("cmd");
        command.arg("/C").arg(script);
        command
    } else {
        let mut command = Command::new("sh");
        command.arg("-c").arg(script);
        command
    };
    command.current_dir(cwd);
    command
}

fn describe(command: &Command) -> String {
    let std = command.as_std();
    std::iter::once(std.get_program())
        .chain(std.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Spawn a long-running process with captured output.
pub fn spawn(ctx: &Context, label: &str, command: Command) -> CommandResult<ProcessHandle> {
    if output::is_verbose() {
        output::muted(&format!("$ {}", describe(&command)));
    }
    Ok(ctx.manager.spawn(label, command, SpawnOptions::captured())?)
}

pub fn spawn_script(ctx: &Context, name: &str, script: &str) -> CommandResult<ProcessHandle> {
    spawn(
        ctx,
        &format!("{name} script"),
        script_command(script, &ctx.config.root),
    )
}

/// Run a one-shot process and fail if it does not exit successfully.
pub async fn run_to_completion(ctx: &Context, label: &str, command: Command) -> CommandResult {
    let handle = spawn(ctx, label, command)?;
    let shutdown = ctx.manager.shutdown_requested();

    tokio::select! {
        exit = handle.wait() => {
            if exit.success() {
                Ok(())
            } else if ctx.manager.is_expected_exit(&exit) {
                Err(CommandError::Interrupted)
            } else {
                Err(failure(&handle, exit))
            }
        }
        () = shutdown.cancelled() => Err(CommandError::Interrupted),
    }
}

fn failure(handle: &ProcessHandle, exit: ExitInfo) -> CommandError {
    CommandError::ProcessFailed {
        label: handle.label().to_string(),
        exit,
        output: output::output_tail(&handle.captured_output()),
    }
}

#[derive(Debug)]
pub enum SessionEnd {
    StudioClosed { opened: bool },
    ProcessExited { handle: ProcessHandle, exit: ExitInfo },
    Interrupted,
}

/// Wait for the first of: a shutdown request, Studio closing the place, or
/// any of `handles` exiting.
pub async fn race(
    ctx: &Context,
    handles: &[ProcessHandle],
    studio: Option<StudioWatch>,
) -> SessionEnd {
    let shutdown = ctx.manager.shutdown_requested();
    let studio = async move {
        match studio {
            Some(watch) => watch.await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        () = shutdown.cancelled() => SessionEnd::Interrupted,
        result = studio => match result {
            Ok(outcome) => SessionEnd::StudioClosed { opened: outcome.opened },
            Err(LockWatchError::Shutdown) => SessionEnd::Interrupted,
        },
        (handle, exit) = first_exit(handles) => SessionEnd::ProcessExited { handle, exit },
    }
}

async fn first_exit(handles: &[ProcessHandle]) -> (ProcessHandle, ExitInfo) {
    let mut waits = JoinSet::new();
    for handle in handles {
        let handle = handle.clone();
        waits.spawn(async move {
            let exit = handle.wait().await;
            (handle, exit)
        });
    }

    loop {
        match waits.join_next().await {
            Some(Ok(first)) => return first,
            Some(Err(e)) => debug!("Exit waiter failed: {e}"),
            None => std::future::pending::<()>().await,
        }
    }
}

/// Tear the session down and turn how it ended into the command result.
pub async fn conclude(ctx: &Context, end: SessionEnd) -> CommandResult {
    // Classify before cleanup; every exit looks expected once shutdown starts.
    let expected = match &end {
        SessionEnd::ProcessExited { exit, .. } => ctx.manager.is_expected_exit(exit),
        _ => true,
    };
    ctx.manager.cleanup().await;

    match end {
        SessionEnd::StudioClosed { opened: true } => {
            output::success("Studio closed the place");
            Ok(())
        }
        SessionEnd::StudioClosed { opened: false } => {
            output::warning("Studio exited before opening the place");
            Ok(())
        }
        SessionEnd::Interrupted => Err(CommandError::Interrupted),
        SessionEnd::ProcessExited { .. } if ctx.manager.signal_received().is_some() => {
            Err(CommandError::Interrupted)
        }
        SessionEnd::ProcessExited { handle, .. } if expected => {
            output::muted(&format!("{} stopped", handle.label()));
            Ok(())
        }
        SessionEnd::ProcessExited { handle, exit } => Err(failure(&handle, exit)),
    }
}

/// Record this invocation in the place's background-task lock until cleanup.
pub async fn claim_background_tasks(ctx: &Context) -> CommandResult {
    let lock = SharedLock::new(ctx.config.tasks_lock_path());
    let me = std::process::id();
    let recorded = {
        let lock = lock.clone();
        let liveness = Arc::clone(&ctx.liveness);
        blocking(move || lock.prune(liveness.as_ref())).await??
    };
    for other in recorded {
        if other != me {
            output::warning(&format!(
                "Another rbxdev session (pid {other}) is already running for this place"
            ));
        }
    }
    lock.add(me)?;

    ctx.manager
        .register_cleanup_hook(hook_fn("release background task lock", move || {
            let lock = lock.clone();
            async move { lock.remove(me).map_err(HookError::from) }
        }));
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rbxdev_proc::{Liveness, ManagerConfig, Platform, ProcessManager};
    use tempfile::TempDir;
    use tokio::sync::watch;

    use super::*;
    use crate::config::{ProjectToml, ResolvedConfig};

    struct AllAlive;

    impl Liveness for AllAlive {
        fn is_process_alive(&self, _pid: u32) -> bool {
            true
        }

        fn is_port_available(&self, _port: u16) -> bool {
            false
        }
    }

    fn context(root: &Path) -> Context {
        Context {
            config: ResolvedConfig::from_toml(root, ProjectToml::default()),
            manager: ProcessManager::new(ManagerConfig {
                graceful_timeout: Duration::from_millis(500),
                cleanup_timeout: Duration::from_millis(1000),
            }),
            studio_platform: Platform::detect(),
            liveness: Arc::new(AllAlive),
        }
    }

    #[test]
    fn script_command_runs_through_the_shell() {
        let command = script_command("npm run watch", Path::new("/work"));
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert_eq!(args.last().map(String::as_str), Some("npm run watch"));
        assert_eq!(
            command.as_std().get_current_dir(),
            Some(Path::new("/work"))
        );
    }

    #[tokio::test]
    async fn studio_close_wins_the_race() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let (_tx, rx) = watch::channel(None);
        let server = ctx.manager.register("rojo serve", 31337, rx).unwrap();

        let studio: StudioWatch = Box::pin(async { Ok(LockWatchOutcome { opened: true }) });
        let end = race(&ctx, &[server], Some(studio)).await;
        assert!(matches!(end, SessionEnd::StudioClosed { opened: true }));
    }

    #[tokio::test]
    async fn shutdown_request_wins_the_race() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        ctx.manager.request_shutdown();

        let end = race(&ctx, &[], None).await;
        assert!(matches!(end, SessionEnd::Interrupted));
        assert!(matches!(
            conclude(&ctx, end).await,
            Err(CommandError::Interrupted)
        ));
    }

    #[tokio::test]
    async fn unexpected_exit_is_a_failure() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let (tx, rx) = watch::channel(None);
        let watcher = ctx.manager.register("watch script", 31338, rx).unwrap();
        tx.send(Some(ExitInfo {
            code: Some(1),
            signal: None,
        }))
        .unwrap();

        let end = race(&ctx, &[watcher], None).await;
        let err = conclude(&ctx, end).await.unwrap_err();
        assert!(
            matches!(&err, CommandError::ProcessFailed { label, .. } if label == "watch script"),
            "got {err}"
        );
        assert_eq!(err.exit_code(), 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_one_shot_reports_its_output() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let command = script_command("echo 'no project file' >&2; exit 4", dir.path());

        let err = run_to_completion(&ctx, "rojo build", command)
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 4);
        let message = err.to_string();
        assert!(
            message.starts_with("rojo build exited unexpectedly (exit code 4)"),
            "{message}"
        );
        assert!(message.contains("no project file"), "{message}");
    }

    #[tokio::test]
    async fn spawning_after_shutdown_is_an_interrupt() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        ctx.manager.request_shutdown();
        ctx.manager.cleanup().await;

        let err = spawn(&ctx, "rojo serve", script_command("exit 0", dir.path())).unwrap_err();
        assert!(matches!(err, CommandError::Interrupted), "got {err}");
        assert!(err.is_silent());
        assert_eq!(err.exit_code(), 130);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_one_shot_is_ok() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        run_to_completion(&ctx, "true", script_command("exit 0", dir.path()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn background_task_lock_is_released_on_cleanup() {
        let dir = TempDir::new().unwrap();
        let ctx = context(dir.path());
        let lock = SharedLock::new(ctx.config.tasks_lock_path());

        claim_background_tasks(&ctx).await.unwrap();
        assert_eq!(lock.pids(), vec![std::process::id()]);

        ctx.manager.cleanup().await;
        assert!(lock.pids().is_empty());
        assert!(!lock.path().exists());
    }
}
