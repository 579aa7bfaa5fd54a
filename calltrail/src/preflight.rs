//! Pre-flight checks for calltrail
//!
//! Validates the environment before attaching to a target.
//! Provides clear, actionable error messages when requirements aren't met.

#![allow(unsafe_code)] // access() requires unsafe

use anyhow::{bail, Result};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

use crate::domain::Pid;
use crate::session::SessionConfig;
use crate::transport::control_socket_path;

/// Run all pre-flight checks before attaching to `pid`
pub fn run_preflight_checks(pid: i32, config: &SessionConfig) -> Result<()> {
    check_process_exists(pid)?;
    check_control_socket(&config.runtime_dir, pid)?;
    check_shm_dir(&config.shm_dir)?;
    Ok(())
}

/// Check if the target process exists
pub fn check_process_exists(pid: i32) -> Result<()> {
    let proc_path = format!("/proc/{pid}");
    if pid <= 0 || !Path::new(&proc_path).exists() {
        bail!(
            "Process {pid} not found.\n\n\
             Is the process still running? Check with: ps -p {pid}"
        );
    }
    Ok(())
}

/// Check that the target exposes a control socket we can connect to
pub fn check_control_socket(runtime_dir: &Path, pid: i32) -> Result<()> {
    let path = control_socket_path(runtime_dir, Pid(pid));
    let Ok(meta) = std::fs::metadata(&path) else {
        bail!(
            "No control socket for process {pid} at {}\n\n\
             This usually means:\n\
             - The process was not started with the calltrail agent loaded\n\
             - The agent uses a different runtime directory (see --runtime-dir)",
            path.display()
        );
    };
    if !meta.file_type().is_socket() {
        bail!("Not a socket: {}", path.display());
    }
    if !writable(&path) {
        bail!(
            "Permission denied: cannot connect to {}\n\n\
             Run calltrail as the same user as the target process.",
            path.display()
        );
    }
    Ok(())
}

/// Check that the shared buffer directory accepts new files
pub fn check_shm_dir(shm_dir: &Path) -> Result<()> {
    if !shm_dir.is_dir() {
        bail!(
            "Shared memory directory not found: {}\n\n\
             Pass an existing directory with --shm-dir.",
            shm_dir.display()
        );
    }
    if !writable(shm_dir) {
        bail!("Permission denied: cannot create files in {}", shm_dir.display());
    }
    Ok(())
}

fn writable(path: &Path) -> bool {
    let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call
    unsafe { libc::access(c_path.as_ptr(), libc::W_OK) == 0 }
}
