//! Process lifecycle coordination for rbxdev.
//!
//! - Liveness and port probes (`probe`)
//! - Platform selection and OS process tables (`platform`)
//! - Leaf-to-root process-tree termination (`tree`)
//! - Plain-text lockfiles with validate-on-read (`lockfile`)
//! - The per-invocation subprocess registry and shutdown coordinator (`manager`)
//! - Studio lockfile open/close watching (`lock_watch`)

pub mod lock_watch;
pub mod lockfile;
pub mod manager;
pub mod platform;
pub mod probe;
pub mod tree;

pub use lock_watch::{LockState, LockWatchError, LockWatchOutcome, LockWatcher};
pub use lockfile::{
    CleanupOutcome, LockError, RetryPolicy, ServerLock, SharedLock, cleanup_lock,
    cleanup_lock_with, read_lock_raw, read_server_lock, write_lock, write_server_lock,
};
pub use manager::{
    CleanupHook, CoordinatorState, ExitInfo, HookError, HookId, ManagerConfig, ManagerError,
    ProcessHandle, ProcessManager, ShutdownSignal, SpawnOptions, hook_fn,
};
pub use platform::Platform;
pub use probe::{
    Liveness, ProbeError, SystemLiveness, find_available_port, is_port_available,
    is_process_alive,
};
pub use tokio_util::sync::CancellationToken;
pub use tree::{
    Delivery, ProcessTable, TreeError, TreeKill, TreeSignal, is_alive_blocking,
    kill_process_tree, kill_process_tree_blocking,
};
