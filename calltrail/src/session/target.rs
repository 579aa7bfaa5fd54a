//! The process being profiled: liveness and pointer width.

#![allow(unsafe_code)] // kill(pid, 0) requires unsafe

use log::debug;
use object::FileKind;
use std::fs::File;
use std::io::Read;

use crate::domain::{Pid, SessionError};

/// Bytes of the executable needed to tell ELF32 from ELF64
const HEADER_PROBE_BYTES: u64 = 64;

/// A running process calltrail can attach to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProcess {
    pid: Pid,
    name: String,
    is_64bit: bool,
}

impl TargetProcess {
    /// Probe a live process.
    ///
    /// # Errors
    /// `InvalidProcess` for a non-positive pid, `ProcessHasExited` if it is gone.
    pub fn open(pid: Pid) -> Result<Self, SessionError> {
        if pid.0 <= 0 {
            return Err(SessionError::InvalidProcess);
        }
        if !is_alive(pid) {
            return Err(SessionError::ProcessHasExited(pid));
        }
        let name = read_comm(pid).unwrap_or_else(|| format!("pid-{}", pid.0));
        let is_64bit = elf_is_64bit(pid);
        debug!("Opened target {name} ({pid}), 64-bit: {is_64bit}");
        Ok(Self { pid, name, is_64bit })
    }

    /// The calling process itself.
    #[must_use]
    pub fn current() -> Self {
        #[allow(clippy::cast_possible_wrap)]
        let pid = Pid(std::process::id() as i32);
        let name = read_comm(pid).unwrap_or_else(|| "self".to_string());
        Self { pid, name, is_64bit: cfg!(target_pointer_width = "64") }
    }

    /// Describe a process without probing it.
    #[must_use]
    pub fn from_parts(pid: Pid, name: impl Into<String>, is_64bit: bool) -> Self {
        Self { pid, name: name.into(), is_64bit }
    }

    #[must_use]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Width of the target's record fields: 8 bytes when true, 4 otherwise
    #[must_use]
    pub fn is_64bit(&self) -> bool {
        self.is_64bit
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        !is_alive(self.pid)
    }
}

/// True while `pid` exists and is not a zombie.
#[must_use]
pub fn is_alive(pid: Pid) -> bool {
    if pid.0 <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs only the existence and permission checks
    let rc = unsafe { libc::kill(pid.0, 0) };
    if rc != 0 && std::io::Error::last_os_error().raw_os_error() != Some(libc::EPERM) {
        return false;
    }
    !is_zombie(pid)
}

fn is_zombie(pid: Pid) -> bool {
    let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid.0)) else {
        return false;
    };
    // "pid (comm) S ..." - comm may itself contain ')'
    stat.rfind(')')
        .and_then(|close| stat[close + 1..].split_whitespace().next())
        .is_some_and(|state| state == "Z" || state == "X")
}

fn read_comm(pid: Pid) -> Option<String> {
    let comm = std::fs::read_to_string(format!("/proc/{}/comm", pid.0)).ok()?;
    let comm = comm.trim_end();
    (!comm.is_empty()).then(|| comm.to_string())
}

/// ELF class of `/proc/<pid>/exe`, defaulting to our own width.
fn elf_is_64bit(pid: Pid) -> bool {
    let host = cfg!(target_pointer_width = "64");
    let mut header = Vec::new();
    let read = File::open(format!("/proc/{}/exe", pid.0))
        .and_then(|file| file.take(HEADER_PROBE_BYTES).read_to_end(&mut header));
    if let Err(e) = read {
        debug!("Cannot read executable of {pid}: {e}");
        return host;
    }
    match FileKind::parse(header.as_slice()) {
        Ok(FileKind::Elf64) => true,
        Ok(FileKind::Elf32) => false,
        _ => host,
    }
}
