//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::session::SessionConfig;

#[derive(Parser, Debug)]
#[command(
    name = "calltrail",
    about = "Follow method calls in an instrumented process and build its call graph",
    after_help = "\
EXAMPLES:
    calltrail my-app                            Auto-detect PID by name
    calltrail --pid 1234                        Explicit PID
    calltrail --pid 1234 --watch Worker.Step    Print stacks reaching a method
    calltrail my-app --duration 30 --export graph.json"
)]
pub struct Args {
    /// Process name to attach to (auto-detects PID)
    #[arg(value_name = "PROCESS")]
    pub process: Option<String>,

    /// Process ID to attach to
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Print call stacks that pass through this method (full or short name)
    #[arg(short, long, value_name = "METHOD")]
    pub watch: Option<String>,

    /// Stop after N seconds (0 = unlimited)
    #[arg(long, default_value = "0")]
    pub duration: u64,

    /// Poll interval in milliseconds
    #[arg(long, default_value = "100", value_name = "MS")]
    pub interval: u64,

    /// Export the call graph as JSON when done
    #[arg(long, value_name = "FILE")]
    pub export: Option<PathBuf>,

    /// Number of hot-path methods to list in the summary
    #[arg(long, default_value = "10")]
    pub top: usize,

    /// Directory holding target control sockets
    #[arg(long, value_name = "DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Directory for the shared record buffer
    #[arg(long, value_name = "DIR")]
    pub shm_dir: Option<PathBuf>,

    /// Shared record buffer size in bytes
    #[arg(long, value_name = "BYTES")]
    pub buffer_size: Option<usize>,

    /// Suppress non-essential output
    #[arg(short, long)]
    pub quiet: bool,
}

impl Args {
    /// Session settings with CLI overrides applied on top of the defaults.
    #[must_use]
    pub fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::default();
        if let Some(ref dir) = self.runtime_dir {
            config.runtime_dir.clone_from(dir);
        }
        if let Some(ref dir) = self.shm_dir {
            config.shm_dir.clone_from(dir);
        }
        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        config
    }

    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.interval.max(1))
    }

    #[must_use]
    pub fn duration_limit(&self) -> Option<Duration> {
        (self.duration > 0).then(|| Duration::from_secs(self.duration))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let args = Args::parse_from(["calltrail", "--pid", "42"]);
        assert_eq!(args.pid, Some(42));
        assert_eq!(args.poll_interval(), Duration::from_millis(100));
        assert_eq!(args.duration_limit(), None);
        assert_eq!(args.top, 10);
        assert_eq!(args.session_config().buffer_size, SessionConfig::default().buffer_size);
    }

    #[test]
    fn test_overrides_reach_session_config() {
        let args = Args::parse_from([
            "calltrail",
            "my-app",
            "--runtime-dir",
            "/run/user/1000",
            "--buffer-size",
            "4096",
            "--duration",
            "5",
        ]);
        let config = args.session_config();
        assert_eq!(config.runtime_dir, PathBuf::from("/run/user/1000"));
        assert_eq!(config.buffer_size, 4096);
        assert_eq!(args.duration_limit(), Some(Duration::from_secs(5)));
        assert_eq!(args.process.as_deref(), Some("my-app"));
    }

    #[test]
    fn test_zero_interval_is_clamped() {
        let args = Args::parse_from(["calltrail", "--pid", "1", "--interval", "0"]);
        assert_eq!(args.poll_interval(), Duration::from_millis(1));
    }
}
