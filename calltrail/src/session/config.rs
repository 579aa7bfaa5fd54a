//! Session tunables
//!
//! Plain struct with defaults; the CLI overrides individual fields.

use calltrail_common::{DEFAULT_BUFFER_BYTES, FIELDS_PER_RECORD, WIDE_FIELD_BYTES};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::SessionError;

/// Default subscriber channel bound, matching the event channels elsewhere
pub const DEFAULT_NOTIFY_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Directory holding target control sockets
    pub runtime_dir: PathBuf,
    /// Directory the shared record buffer is created in
    pub shm_dir: PathBuf,
    /// Size of the shared record buffer in bytes
    pub buffer_size: usize,
    /// How long `attach` keeps retrying the control socket
    pub connect_timeout: Duration,
    /// Upper bound on waiting for any single reply; `None` waits forever
    pub reply_timeout: Option<Duration>,
    /// Sleep between empty reads of the record buffer
    pub idle_backoff: Duration,
    /// How often the attached target is checked for exit
    pub exit_poll_interval: Duration,
    /// Bound of each status subscriber's channel
    pub notify_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            runtime_dir: std::env::temp_dir(),
            shm_dir: default_shm_dir(),
            buffer_size: DEFAULT_BUFFER_BYTES,
            connect_timeout: Duration::from_secs(5),
            reply_timeout: Some(Duration::from_secs(60)),
            idle_backoff: Duration::from_secs(1),
            exit_poll_interval: Duration::from_millis(500),
            notify_capacity: DEFAULT_NOTIFY_CAPACITY,
        }
    }
}

impl SessionConfig {
    /// Reject settings that cannot produce a working session.
    ///
    /// # Errors
    /// Returns `InvalidConfiguration` naming the offending field.
    pub fn validate(&self) -> Result<(), SessionError> {
        let min_buffer = WIDE_FIELD_BYTES * FIELDS_PER_RECORD;
        if self.buffer_size < min_buffer {
            return Err(SessionError::InvalidConfiguration(format!(
                "buffer_size must be at least {min_buffer} bytes, got {}",
                self.buffer_size
            )));
        }
        if self.notify_capacity == 0 {
            return Err(SessionError::InvalidConfiguration(
                "notify_capacity must be non-zero".to_string(),
            ));
        }
        if !self.shm_dir.is_dir() {
            return Err(SessionError::InvalidConfiguration(format!(
                "shm_dir {} is not a directory",
                self.shm_dir.display()
            )));
        }
        Ok(())
    }
}

/// `/dev/shm` when present, otherwise the temp dir.
#[must_use]
pub fn default_shm_dir() -> PathBuf {
    let shm = Path::new("/dev/shm");
    if shm.is_dir() {
        shm.to_path_buf()
    } else {
        std::env::temp_dir()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = SessionConfig::default();
        assert_eq!(config.buffer_size, 400_000_000);
        assert_eq!(config.idle_backoff, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tiny_buffer_rejected() {
        let config = SessionConfig { buffer_size: 8, ..SessionConfig::default() };
        let err = config.validate().unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfiguration(_)));
        assert_eq!(err.code(), 0x1000);
    }

    #[test]
    fn test_missing_shm_dir_rejected() {
        let config = SessionConfig {
            shm_dir: PathBuf::from("/nonexistent/calltrail/shm"),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
