use std::net::{Ipv4Addr, TcpListener};

use thiserror::Error;

use crate::platform::Platform;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("No available port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },
}

/// Liveness questions asked when validating lock records.
pub trait Liveness: Send + Sync {
    fn is_process_alive(&self, pid: u32) -> bool;
    fn is_port_available(&self, port: u16) -> bool;
}

/// Answers liveness questions against the real OS.
#[derive(Debug, Clone, Copy)]
pub struct SystemLiveness {
    platform: Platform,
}

impl SystemLiveness {
    pub fn new(platform: Platform) -> Self {
        Self { platform }
    }
}

impl Default for SystemLiveness {
    fn default() -> Self {
        Self::new(Platform::detect())
    }
}

impl Liveness for SystemLiveness {
    fn is_process_alive(&self, pid: u32) -> bool {
        self.platform.is_process_alive(pid)
    }

    fn is_port_available(&self, port: u16) -> bool {
        is_port_available(port)
    }
}

/// Whether `pid` refers to a running process on this host.
///
/// Query failures count as "not running".
pub fn is_process_alive(pid: u32) -> bool {
    Platform::detect().is_process_alive(pid)
}

/// Whether a TCP listener can be bound on `127.0.0.1:port` right now.
///
/// Every bind failure counts as unavailable, not just `AddrInUse`.
pub fn is_port_available(port: u16) -> bool {
    TcpListener::bind((Ipv4Addr::LOCALHOST, port)).is_ok()
}

/// Return the first available port in `start..start + max_attempts`.
pub fn find_available_port(start: u16, max_attempts: u16) -> Result<u16, ProbeError> {
    find_available_port_with(start, max_attempts, is_port_available)
}

fn find_available_port_with(
    start: u16,
    max_attempts: u16,
    available: impl Fn(u16) -> bool,
) -> Result<u16, ProbeError> {
    let mut end = start;
    for offset in 0..max_attempts {
        let Some(port) = start.checked_add(offset) else {
            break;
        };
        end = port;
        if available(port) {
            return Ok(port);
        }
    }

    Err(ProbeError::PortRangeExhausted { start, end })
}
