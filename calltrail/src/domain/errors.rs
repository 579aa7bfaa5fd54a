//! Structured error types for calltrail
//!
//! Using thiserror for automatic Display implementation and error chaining.
//! Attach failures also carry a numeric status code (see [`SessionError::code`])
//! so callers that speak in result codes can report them unchanged.

use super::types::Pid;
use std::path::PathBuf;
use thiserror::Error;

/// Numeric status codes reported by [`SessionError::code`].
pub mod codes {
    pub const SUCCESS: u32 = 0x0;
    pub const FILE_NOT_FOUND: u32 = 0x2;
    pub const INVALID_CONFIGURATION: u32 = 0x1000;
    pub const INVALID_PROCESS: u32 = 0x1001;
    pub const NO_RUNTIME_TO_ATTACH_TO: u32 = 0x1002;
    pub const PROCESS_HAS_EXITED: u32 = 0x1003;
    pub const MALFORMED_REPLY: u32 = 0x1004;
    pub const NOT_ATTACHED: u32 = 0x1005;
    pub const BUSY: u32 = 0x1006;
    pub const IO: u32 = 0x1007;
    pub const CONCURRENT_GC_NOT_SUPPORTED: u32 =
        calltrail_common::STATUS_CONCURRENT_GC_NOT_PROFILABLE;
}

/// Failure to open a control channel.
#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("Timed out after {timeout_ms}ms connecting to {}", path.display())]
    ConnectTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("Failed to connect to {}: {source}", path.display())]
    ConnectFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Select a process to attach to")]
    InvalidProcess,

    #[error("Process {0} has exited")]
    ProcessHasExited(Pid),

    #[error("No instrumented runtime to attach to in process {pid}")]
    NoRuntimeToAttachTo {
        pid: Pid,
        #[source]
        source: ChannelError,
    },

    #[error("Target runtime uses concurrent GC, which cannot be profiled")]
    ConcurrentGcNotSupported,

    #[error("Failed to send shared memory name to profiler: {0}")]
    ChannelAnnounceFailed(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Malformed reply to {command}: {reply:?}")]
    MalformedReply { command: String, reply: Option<String> },

    #[error("Not attached to a process")]
    NotAttached,

    #[error("Session is busy: {0}")]
    Busy(&'static str),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SessionError {
    /// Numeric status code for this failure (`0` is reserved for success).
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            Self::InvalidProcess => codes::INVALID_PROCESS,
            Self::ProcessHasExited(_) => codes::PROCESS_HAS_EXITED,
            Self::NoRuntimeToAttachTo { .. } | Self::Channel(_) => codes::NO_RUNTIME_TO_ATTACH_TO,
            Self::ConcurrentGcNotSupported => codes::CONCURRENT_GC_NOT_SUPPORTED,
            Self::ChannelAnnounceFailed(_) => codes::FILE_NOT_FOUND,
            Self::InvalidConfiguration(_) => codes::INVALID_CONFIGURATION,
            Self::MalformedReply { .. } => codes::MALFORMED_REPLY,
            Self::NotAttached => codes::NOT_ATTACHED,
            Self::Busy(_) => codes::BUSY,
            Self::Io(_) => codes::IO,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Failed to write graph file: {0}")]
    WriteFailed(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}
