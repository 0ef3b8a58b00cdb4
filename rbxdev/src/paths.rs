use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const SERVER_LOCK_SUFFIX: &str = ".rojo.lock";
pub const STUDIO_LOCK_SUFFIX: &str = ".lock";
pub const TASKS_LOCK_SUFFIX: &str = ".tasks.lock";

/// Append `suffix` to the full file name (`game.rbxl` -> `game.rbxl.lock`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

pub fn server_lock_path(output: &Path) -> PathBuf {
    with_suffix(output, SERVER_LOCK_SUFFIX)
}

pub fn studio_lock_path(output: &Path) -> PathBuf {
    with_suffix(output, STUDIO_LOCK_SUFFIX)
}

pub fn tasks_lock_path(output: &Path) -> PathBuf {
    with_suffix(output, TASKS_LOCK_SUFFIX)
}

/// Walk up from `start` to the first directory containing `file_name`.
pub fn find_project_root(start: &Path, file_name: &str) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(file_name).is_file())
        .map(Path::to_path_buf)
}

/// Non-empty value of an environment variable.
pub fn env_override(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The `rojo` executable, overridable with `RBXDEV_ROJO`.
pub fn rojo_executable() -> String {
    env_override("RBXDEV_ROJO").unwrap_or_else(|| "rojo".to_string())
}
