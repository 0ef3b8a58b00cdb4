pub mod build;
pub mod open;
pub mod serve;
pub mod session;
pub mod start;
pub mod stop;
pub mod syncback;
pub mod watch;

use std::path::PathBuf;
use std::sync::Arc;

use rbxdev_proc::{
    ExitInfo, LockError, Liveness, ManagerConfig, ManagerError, Platform, ProbeError,
    ProcessManager, ProcessTable, SystemLiveness, TreeError,
};
use thiserror::Error;

use crate::config::{ConfigError, ResolvedConfig};
use crate::studio::StudioError;

/// Exit code for a session ended by Ctrl+C.
pub const EXIT_INTERRUPTED: i32 = 130;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Manager(ManagerError),

    #[error(transparent)]
    Tree(#[from] TreeError),

    #[error(transparent)]
    Probe(#[from] ProbeError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Studio(#[from] StudioError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("Background query failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("{label} exited unexpectedly ({exit}){}", output_suffix(.output))]
    ProcessFailed {
        label: String,
        exit: ExitInfo,
        output: Option<String>,
    },

    #[error("Roblox Studio has {} open; close it first or pass --force", .0.display())]
    PlaceOpen(PathBuf),

    #[error("Place file {} does not exist; run `rbxdev build` first", .0.display())]
    MissingPlace(PathBuf),

    #[error("Interrupted")]
    Interrupted,
}

fn output_suffix(output: &Option<String>) -> String {
    output
        .as_deref()
        .map(|tail| format!(":\n{tail}"))
        .unwrap_or_default()
}

impl From<ManagerError> for CommandError {
    /// A spawn refused because shutdown already started is part of the
    /// interrupt, not a failure of its own.
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::ShuttingDown(_) | ManagerError::Cancelled(_) => CommandError::Interrupted,
            other => CommandError::Manager(other),
        }
    }
}

impl CommandError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CommandError::Interrupted => EXIT_INTERRUPTED,
            CommandError::ProcessFailed { exit, .. } => match exit.code {
                Some(code) if code != 0 => code,
                _ => 1,
            },
            _ => 1,
        }
    }

    /// Errors that should end the process quietly.
    pub fn is_silent(&self) -> bool {
        matches!(self, CommandError::Interrupted)
    }
}

pub type CommandResult<T = ()> = Result<T, CommandError>;

/// Run a synchronous process-table or lock query on the blocking pool.
pub async fn blocking<T, F>(query: F) -> CommandResult<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    Ok(tokio::task::spawn_blocking(query).await?)
}

/// Everything a command needs for one invocation.
pub struct Context {
    pub config: ResolvedConfig,
    pub manager: ProcessManager,
    /// Platform Studio runs on (Windows when we are inside WSL).
    pub studio_platform: Platform,
    pub liveness: Arc<dyn Liveness>,
}

impl Context {
    pub fn new(config: ResolvedConfig) -> Self {
        let platform = Platform::detect();
        Self {
            config,
            manager: ProcessManager::new(ManagerConfig::default()),
            studio_platform: Platform::detect_for_external_app(),
            liveness: Arc::new(SystemLiveness::new(platform)),
        }
    }

    pub fn table(&self) -> Arc<dyn ProcessTable> {
        self.manager.table()
    }
}
