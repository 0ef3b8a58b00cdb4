//! Roblox Studio launching and detection.

use std::path::{Path, PathBuf};

use rbxdev_proc::platform::tasklist_csv_pids;
use rbxdev_proc::{Platform, ProcessTable, TreeError, TreeSignal, kill_process_tree};
use sysinfo::{ProcessesToUpdate, System};
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::paths;

const WINDOWS_IMAGE: &str = "RobloxStudioBeta.exe";
const POSIX_PROCESS_NAME: &str = "RobloxStudio";

#[derive(Debug, Error)]
pub enum StudioError {
    #[error(
        "Roblox Studio cannot be launched on this platform; set RBXDEV_STUDIO to a launcher command"
    )]
    Unsupported,

    #[error("Failed to translate {path} to a Windows path: {detail}")]
    Wslpath { path: PathBuf, detail: String },
}

/// Command that opens `place` in Studio and stays alive while Studio runs.
pub fn launch_command(platform: Platform, place: &Path) -> Result<Command, StudioError> {
    if let Some(launcher) = paths::env_override("RBXDEV_STUDIO") {
        let mut command = Command::new(launcher);
        command.arg(place);
        return Ok(command);
    }

    match platform {
        Platform::Windows { wsl: false } => Ok(windows_start("cmd", place.as_os_str())),
        Platform::Windows { wsl: true } => {
            let windows_path = wslpath(place)?;
            let mut command = windows_start("cmd.exe", windows_path.as_ref());
            // cmd.exe warns about UNC working directories inside the distro.
            command.current_dir("/mnt/c");
            Ok(command)
        }
        Platform::Posix if cfg!(target_os = "macos") => {
            let mut command = Command::new("open");
            command.args(["-W", "-a", POSIX_PROCESS_NAME]).arg(place);
            Ok(command)
        }
        Platform::Posix => Err(StudioError::Unsupported),
    }
}

fn windows_start(cmd: &str, place: &std::ffi::OsStr) -> Command {
    let mut command = Command::new(cmd);
    // Empty window title; otherwise a quoted place path is taken as the title.
    command.args(["/C", "start", "", "/WAIT"]).arg(place);
    command
}

fn wslpath(path: &Path) -> Result<String, StudioError> {
    let output = std::process::Command::new("wslpath")
        .arg("-w")
        .arg(path)
        .output()
        .map_err(|e| StudioError::Wslpath {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
    if !output.status.success() {
        return Err(StudioError::Wslpath {
            path: path.to_path_buf(),
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

/// Pids of running Studio processes.
pub fn find_studio_pids(platform: Platform) -> Vec<u32> {
    match platform {
        Platform::Windows { .. } => {
            let tool = platform.windows_tool("tasklist");
            let filter = format!("IMAGENAME eq {WINDOWS_IMAGE}");
            match std::process::Command::new(&tool)
                .args(["/FI", filter.as_str(), "/NH", "/FO", "CSV"])
                .output()
            {
                Ok(output) => tasklist_csv_pids(&String::from_utf8_lossy(&output.stdout)),
                Err(e) => {
                    debug!("Failed to run {tool}: {e}");
                    Vec::new()
                }
            }
        }
        Platform::Posix => {
            let mut sys = System::new();
            sys.refresh_processes(ProcessesToUpdate::All, true);
            let mut pids: Vec<u32> = sys
                .processes()
                .iter()
                .filter(|(_, p)| {
                    p.thread_kind().is_none()
                        && p.name().to_string_lossy().starts_with(POSIX_PROCESS_NAME)
                })
                .map(|(pid, _)| pid.as_u32())
                .collect();
            pids.sort_unstable();
            pids
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaceLock {
    /// No Studio lock next to the place.
    Free,
    /// Lock present and Studio is running.
    Held,
    /// Lock left behind by a Studio that is no longer running.
    Stale,
}

pub fn place_lock_state(lock_path: &Path, studio_pids: &[u32]) -> PlaceLock {
    if !lock_path.exists() {
        PlaceLock::Free
    } else if studio_pids.is_empty() {
        PlaceLock::Stale
    } else {
        PlaceLock::Held
    }
}

/// Terminate the process tree of every Studio in `now` that was not already
/// running in `before`. Returns the pids that were signaled.
pub fn stop_launched(
    table: &dyn ProcessTable,
    before: &[u32],
    now: &[u32],
) -> Result<Vec<u32>, TreeError> {
    let launched: Vec<u32> = now
        .iter()
        .copied()
        .filter(|pid| !before.contains(pid))
        .collect();
    for &pid in &launched {
        kill_process_tree(table, pid, TreeSignal::Terminate)?;
    }
    Ok(launched)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use rbxdev_proc::Delivery;
    use tempfile::TempDir;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        signaled: Mutex<Vec<u32>>,
    }

    impl ProcessTable for Recorder {
        fn is_alive(&self, pid: u32) -> bool {
            !self.signaled.lock().unwrap().contains(&pid)
        }

        fn children_of(&self, _pid: u32) -> Vec<u32> {
            Vec::new()
        }

        fn send_signal(&self, pid: u32, _signal: TreeSignal) -> Result<Delivery, TreeError> {
            self.signaled.lock().unwrap().push(pid);
            Ok(Delivery::Sent)
        }
    }

    #[test]
    fn only_studios_started_since_the_launch_are_stopped() {
        let table = Recorder::default();
        let stopped = stop_launched(&table, &[100, 200], &[100, 200, 300]).unwrap();
        assert_eq!(stopped, vec![300]);
        assert_eq!(*table.signaled.lock().unwrap(), vec![300]);

        let table = Recorder::default();
        assert!(stop_launched(&table, &[100], &[100]).unwrap().is_empty());
        assert!(table.signaled.lock().unwrap().is_empty());
    }

    fn args(command: &Command) -> Vec<String> {
        command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn windows_launch_waits_on_start() {
        let command = launch_command(
            Platform::Windows { wsl: false },
            Path::new("C:\\game\\build\\game.rbxl"),
        )
        .unwrap();
        assert_eq!(command.as_std().get_program(), "cmd");
        assert_eq!(
            args(&command),
            vec!["/C", "start", "", "/WAIT", "C:\\game\\build\\game.rbxl"]
        );
    }

    #[cfg(all(unix, not(target_os = "macos")))]
    #[test]
    fn plain_linux_has_no_studio() {
        if paths::env_override("RBXDEV_STUDIO").is_some() {
            return;
        }
        let err = launch_command(Platform::Posix, Path::new("game.rbxl")).unwrap_err();
        assert!(matches!(err, StudioError::Unsupported));
    }

    #[cfg(target_os = "macos")]
    #[test]
    fn macos_launch_uses_open_wait() {
        let command = launch_command(Platform::Posix, Path::new("/g/game.rbxl")).unwrap();
        assert_eq!(command.as_std().get_program(), "open");
        assert_eq!(
            args(&command),
            vec!["-W", "-a", "RobloxStudio", "/g/game.rbxl"]
        );
    }

    #[test]
    fn place_lock_states() {
        let dir = TempDir::new().unwrap();
        let lock = dir.path().join("game.rbxl.lock");
        assert_eq!(place_lock_state(&lock, &[4242]), PlaceLock::Free);

        std::fs::write(&lock, "").unwrap();
        assert_eq!(place_lock_state(&lock, &[4242]), PlaceLock::Held);
        assert_eq!(place_lock_state(&lock, &[]), PlaceLock::Stale);
    }
}
