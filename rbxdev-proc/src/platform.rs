//! Platform selection and the OS-backed process tables.
//!
//! The platform is chosen once and hands out a [`ProcessTable`]. POSIX hosts
//! read the process table through `sysinfo` and signal with `kill(2)`. Windows
//! hosts (and Windows processes seen from WSL) go through `tasklist` and
//! `taskkill`.

use std::collections::HashMap;
use std::process::Command;
use std::sync::Arc;

use sysinfo::{Pid, ProcessStatus, ProcessesToUpdate, System};
use tracing::debug;

use crate::tree::{Delivery, ProcessTable, TreeError, TreeKill, TreeSignal};

/// `taskkill` exit code for "process not found".
const TASKKILL_NOT_FOUND: i32 = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Posix,
    /// `wsl` is set when the Windows tools are reached from inside WSL and
    /// must be invoked with their `.exe` names.
    Windows { wsl: bool },
}

impl Platform {
    /// Platform for processes this CLI spawns itself.
    pub fn detect() -> Self {
        if cfg!(windows) {
            Platform::Windows { wsl: false }
        } else {
            Platform::Posix
        }
    }

    /// Platform for the external editor, which runs on the Windows side under WSL.
    pub fn detect_for_external_app() -> Self {
        if is_wsl() {
            Platform::Windows { wsl: true }
        } else {
            Self::detect()
        }
    }

    pub fn is_windows(self) -> bool {
        matches!(self, Platform::Windows { .. })
    }

    /// Name of a Windows command-line tool as invoked from this host.
    pub fn windows_tool(self, name: &str) -> String {
        match self {
            Platform::Windows { wsl: true } => format!("{name}.exe"),
            _ => name.to_string(),
        }
    }

    pub fn process_table(self) -> Arc<dyn ProcessTable> {
        match self {
            Platform::Posix => Arc::new(PosixProcessTable),
            Platform::Windows { wsl } => Arc::new(WindowsProcessTable { wsl }),
        }
    }

    pub fn is_process_alive(self, pid: u32) -> bool {
        match self {
            Platform::Posix => PosixProcessTable.is_alive(pid),
            Platform::Windows { wsl } => WindowsProcessTable { wsl }.is_alive(pid),
        }
    }
}

/// Whether this Linux host is a WSL distribution.
pub fn is_wsl() -> bool {
    if !cfg!(target_os = "linux") {
        return false;
    }
    if std::env::var_os("WSL_DISTRO_NAME").is_some() {
        return true;
    }
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|release| release.to_ascii_lowercase().contains("microsoft"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PosixProcessTable;

impl ProcessTable for PosixProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        let target = Pid::from_u32(pid);
        let mut sys = System::new();
        sys.refresh_processes(ProcessesToUpdate::Some(&[target]), true);
        sys.process(target)
            .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
    }

    fn children_of(&self, pid: u32) -> Vec<u32> {
        sysinfo_children(pid)
    }

    fn children_map(&self) -> Option<HashMap<u32, Vec<u32>>> {
        Some(sysinfo_children_map())
    }

    #[cfg(unix)]
    fn send_signal(&self, pid: u32, signal: TreeSignal) -> Result<Delivery, TreeError> {
        // pid 0 and negative values address process groups.
        let raw = match i32::try_from(pid) {
            Ok(raw) if raw > 0 => raw,
            _ => return Err(TreeError::InvalidPid(pid)),
        };

        // SAFETY: kill(2) takes plain integers and has no memory-safety preconditions.
        if unsafe { libc::kill(raw, signal.as_raw()) } == 0 {
            return Ok(Delivery::Sent);
        }

        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            Ok(Delivery::NotFound)
        } else {
            Err(TreeError::Signal { pid, source: err })
        }
    }

    #[cfg(not(unix))]
    fn send_signal(&self, _pid: u32, _signal: TreeSignal) -> Result<Delivery, TreeError> {
        Err(TreeError::Unsupported("POSIX signal delivery"))
    }
}

fn sysinfo_children(pid: u32) -> Vec<u32> {
    sysinfo_children_map().remove(&pid).unwrap_or_default()
}

/// Parent to children map over real processes. Linux lists threads as
/// processes parented to their owner; those are left out.
fn sysinfo_children_map() -> HashMap<u32, Vec<u32>> {
    let mut sys = System::new();
    sys.refresh_processes(ProcessesToUpdate::All, true);
    let mut map: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, process) in sys.processes() {
        if process.thread_kind().is_some() {
            continue;
        }
        if let Some(parent) = process.parent() {
            map.entry(parent.as_u32()).or_default().push(pid.as_u32());
        }
    }
    for children in map.values_mut() {
        children.sort_unstable();
    }
    map
}

#[derive(Debug, Clone, Copy)]
pub struct WindowsProcessTable {
    wsl: bool,
}

impl WindowsProcessTable {
    fn platform(&self) -> Platform {
        Platform::Windows { wsl: self.wsl }
    }

    fn taskkill(&self, pid: u32, args: &[&str]) -> Result<Delivery, TreeError> {
        let tool = self.platform().windows_tool("taskkill");
        let pid_arg = pid.to_string();
        let output = Command::new(&tool)
            .args(["/PID", pid_arg.as_str()])
            .args(args)
            .output()
            .map_err(|e| TreeError::TreeKill {
                pid,
                detail: format!("failed to run {tool}: {e}"),
            })?;

        classify_taskkill(
            output.status.code(),
            &String::from_utf8_lossy(&output.stdout),
            &String::from_utf8_lossy(&output.stderr),
        )
        .map_err(|detail| TreeError::TreeKill { pid, detail })
    }
}

impl ProcessTable for WindowsProcessTable {
    fn is_alive(&self, pid: u32) -> bool {
        let tool = self.platform().windows_tool("tasklist");
        let filter = format!("PID eq {pid}");
        match Command::new(&tool)
            .args(["/FI", filter.as_str(), "/NH", "/FO", "CSV"])
            .output()
        {
            Ok(output) if output.status.success() => {
                tasklist_csv_pids(&String::from_utf8_lossy(&output.stdout)).contains(&pid)
            }
            Ok(_) => false,
            Err(e) => {
                debug!("Failed to run {tool}: {e}");
                false
            }
        }
    }

    fn children_of(&self, pid: u32) -> Vec<u32> {
        // WSL cannot see the Windows process table; the native tree kill covers it.
        if self.wsl {
            Vec::new()
        } else {
            sysinfo_children(pid)
        }
    }

    fn children_map(&self) -> Option<HashMap<u32, Vec<u32>>> {
        (!self.wsl).then(sysinfo_children_map)
    }

    fn send_signal(&self, pid: u32, signal: TreeSignal) -> Result<Delivery, TreeError> {
        if signal.is_forced() {
            self.taskkill(pid, &["/F"])
        } else {
            self.taskkill(pid, &[])
        }
    }

    fn kill_tree_native(
        &self,
        root: u32,
        _signal: TreeSignal,
    ) -> Option<Result<TreeKill, TreeError>> {
        let result = self.taskkill(root, &["/T", "/F"]).map(|delivery| {
            let mut report = TreeKill::default();
            match delivery {
                Delivery::Sent => report.signaled.push(root),
                Delivery::NotFound => report.skipped.push(root),
            }
            report
        });
        Some(result)
    }
}

/// Interpret a `taskkill` outcome; "not found" means the process is already gone.
fn classify_taskkill(code: Option<i32>, stdout: &str, stderr: &str) -> Result<Delivery, String> {
    if code == Some(0) {
        return Ok(Delivery::Sent);
    }

    let detail = if stderr.trim().is_empty() {
        stdout.trim()
    } else {
        stderr.trim()
    };
    if code == Some(TASKKILL_NOT_FOUND) || detail.to_ascii_lowercase().contains("not found") {
        return Ok(Delivery::NotFound);
    }

    Err(if detail.is_empty() {
        format!("taskkill exited with {code:?} (no output)")
    } else {
        detail.to_string()
    })
}

/// PIDs from `tasklist /FO CSV /NH` output (`"image","pid",...` per line).
pub fn tasklist_csv_pids(stdout: &str) -> Vec<u32> {
    stdout
        .lines()
        .filter_map(|line| {
            let mut fields = line.split("\",\"");
            fields.next()?;
            fields.next()?.trim_matches('"').parse::<u32>().ok()
        })
        .collect()
}
