//! Find attachable processes by name or by their control sockets.

use anyhow::{bail, Context, Result};
use calltrail_common::CONTROL_SOCKET_PREFIX;
use std::fs;
use std::path::{Path, PathBuf};

use crate::domain::Pid;
use crate::transport::control_socket_path;

/// Result of process lookup.
#[derive(Debug)]
pub struct ProcessInfo {
    pub pid: i32,
    pub exe_path: PathBuf,
    pub command: String,
    /// A control socket for this pid exists in the runtime directory
    pub attachable: bool,
}

/// Find a process by name.
///
/// Searches `/proc` for processes whose command name (from `/proc/<pid>/stat`)
/// or executable basename matches `name`. When several match, only the ones
/// with a control socket in `runtime_dir` are kept.
///
/// # Errors
/// - No processes found
/// - Multiple processes found (ambiguous)
pub fn find_process_by_name(name: &str, runtime_dir: &Path) -> Result<ProcessInfo> {
    let own_pid = std::process::id();
    let mut matches: Vec<ProcessInfo> = Vec::new();

    let proc_dir = fs::read_dir("/proc").context("Failed to read /proc")?;

    for entry in proc_dir.flatten() {
        let file_name = entry.file_name();
        let Ok(pid) = file_name.to_string_lossy().parse::<i32>() else {
            continue;
        };
        if u32::try_from(pid).is_ok_and(|p| p == own_pid) {
            continue;
        }

        // Skip kernel threads and inaccessible processes
        let Ok(exe_path) = fs::read_link(format!("/proc/{pid}/exe")) else {
            continue;
        };
        let Ok(stat_content) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
            continue;
        };
        let Ok(command) = extract_comm(&stat_content) else {
            continue;
        };

        if is_match(&command, &exe_path, name) {
            let attachable = control_socket_path(runtime_dir, Pid(pid)).exists();
            matches.push(ProcessInfo { pid, exe_path, command, attachable });
        }
    }

    if matches.len() > 1 && matches.iter().any(|m| m.attachable) {
        matches.retain(|m| m.attachable);
    }

    match matches.len() {
        0 => {
            let attachable = list_attachable(runtime_dir).unwrap_or_default();
            if attachable.is_empty() {
                bail!(
                    "No process matching '{name}' found.\n\
                     Check running processes with: ps aux | grep {name}"
                );
            }
            let list: Vec<String> = attachable.iter().map(|pid| format!("  {pid}")).collect();
            bail!(
                "No process matching '{name}' found.\n\
                 Processes with a control socket in {}:\n{}\n\n\
                 Attach by PID: calltrail --pid <PID>",
                runtime_dir.display(),
                list.join("\n")
            )
        }
        1 => Ok(matches.remove(0)),
        _ => {
            let list: Vec<String> = matches
                .iter()
                .map(|m| format!("  {} ({}) {}", m.pid, m.command, m.exe_path.display()))
                .collect();
            bail!(
                "Multiple processes match '{name}':\n{}\n\n\
                 Specify PID explicitly: calltrail --pid <PID>",
                list.join("\n")
            )
        }
    }
}

/// Pids that currently expose a control socket in `runtime_dir`, sorted.
///
/// # Errors
/// Returns error if `runtime_dir` cannot be read.
pub fn list_attachable(runtime_dir: &Path) -> Result<Vec<i32>> {
    let entries = fs::read_dir(runtime_dir)
        .with_context(|| format!("Failed to read {}", runtime_dir.display()))?;

    let mut pids: Vec<i32> = entries
        .flatten()
        .filter_map(|entry| parse_socket_pid(&entry.file_name().to_string_lossy()))
        .filter(|pid| Path::new(&format!("/proc/{pid}")).exists())
        .collect();
    pids.sort_unstable();
    Ok(pids)
}

/// Pid encoded in a control socket file name.
fn parse_socket_pid(file_name: &str) -> Option<i32> {
    file_name.strip_prefix(CONTROL_SOCKET_PREFIX)?.strip_suffix(".sock")?.parse().ok()
}

/// Extract command name from `/proc/<pid>/stat`.
/// Format: "pid (comm) state ..."
fn extract_comm(stat_line: &str) -> Result<String> {
    let open = stat_line.find('(').context("Invalid stat format")?;
    let close = stat_line.rfind(')').context("Invalid stat format")?;
    if open >= close {
        bail!("Invalid stat format");
    }
    Ok(stat_line[open + 1..close].to_string())
}

/// Check if process matches the search pattern.
fn is_match(command: &str, exe_path: &Path, pattern: &str) -> bool {
    let exe_basename = exe_path.file_name().and_then(|n| n.to_str()).unwrap_or("");

    let pattern_basename =
        Path::new(pattern).file_name().and_then(|n| n.to_str()).unwrap_or(pattern);

    command == pattern_basename
        || exe_basename == pattern_basename
        || command.contains(pattern)
        || exe_basename.contains(pattern)
}
