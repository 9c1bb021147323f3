use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

#[cfg(target_os = "linux")]
use crate::core::Error;
use crate::core::Result;

/// Opaque identity of one coordinating instance.
///
/// Unique per [`InstanceId::generate`] call, so several instances inside one
/// process (tests, embedded hosts) never collide.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct InstanceId(u64);

impl InstanceId {
    pub fn generate() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let pid = std::process::id() as u64;
        let seq = NEXT.fetch_add(1, Ordering::Relaxed);
        let raw = nanos.rotate_left(21) ^ (pid << 40) ^ seq.wrapping_mul(0x9E37_79B9_7F4A_7C15);
        Self(raw.max(1))
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// The OS identity of a process: pid plus its start time, which together
/// survive pid reuse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessIdentity {
    pub pid: u32,
    pub start_time: u64,
}

impl ProcessIdentity {
    pub fn current() -> Self {
        let pid = std::process::id();
        let start_time = proc_start_time(pid).unwrap_or(0);
        Self { pid, start_time }
    }

    pub const fn unknown() -> Self {
        Self {
            pid: 0,
            start_time: 0,
        }
    }
}

/// Whether the process that wrote `identity` is still running.
///
/// `None` means it cannot be told: the identity is unknown or the platform
/// has no `/proc`. Callers then fall back to heartbeat freshness.
pub fn process_alive(identity: ProcessIdentity) -> Option<bool> {
    if identity.pid == 0 || identity.start_time == 0 {
        return None;
    }
    probe(identity)
}

#[cfg(target_os = "linux")]
fn probe(identity: ProcessIdentity) -> Option<bool> {
    match proc_start_time(identity.pid) {
        Ok(start) => Some(start == identity.start_time),
        Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => Some(false),
        Err(_) => None,
    }
}

#[cfg(not(target_os = "linux"))]
fn probe(_identity: ProcessIdentity) -> Option<bool> {
    None
}

/// Field 22 of `/proc/<pid>/stat`, counted after the parenthesised comm so
/// that spaces in the command name do not shift it.
#[cfg(target_os = "linux")]
fn proc_start_time(pid: u32) -> Result<u64> {
    let contents = std::fs::read_to_string(format!("/proc/{pid}/stat"))?;
    let end = contents.rfind(')').ok_or(Error::Corrupt("stat parse"))?;
    contents[end + 1..]
        .split_whitespace()
        .nth(19)
        .ok_or(Error::Corrupt("stat missing starttime"))?
        .parse::<u64>()
        .map_err(|_| Error::Corrupt("stat starttime invalid"))
}

#[cfg(not(target_os = "linux"))]
fn proc_start_time(_pid: u32) -> Result<u64> {
    Ok(0)
}
