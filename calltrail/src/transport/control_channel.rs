//! # Control Channel
//!
//! Synchronous request/response messaging with the instrumented target over
//! a Unix domain stream socket.
//!
//! ## Wire Format
//!
//! - **Text messages**: UTF-16LE code units followed by one NUL code unit,
//!   at most [`MAX_MESSAGE_BYTES`] including the terminator. Longer text is
//!   truncated, not rejected.
//! - **Framed bytes**: `[len: u32 LE][payload: len bytes]`.
//!
//! A stream socket does not keep message boundaries, so the reader splits on
//! the terminator and keeps any surplus for the next read. This matters for
//! two-phase commands, whose acks may arrive in one segment.
//!
//! I/O failures never escape as errors once connected: writes return `false`
//! and reads return `None`, and the caller decides whether that is fatal.

use calltrail_common::{BYTES_PER_CHAR, CONTROL_SOCKET_PREFIX, MAX_MESSAGE_BYTES};
use log::debug;
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::domain::{ChannelError, Pid};

/// Size of the length prefix on framed byte messages
const FRAME_HEADER_BYTES: usize = std::mem::size_of::<u32>();

/// Frames above this size are treated as garbage rather than allocated
const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Pause between connection attempts while the target has not started listening
const CONNECT_RETRY: Duration = Duration::from_millis(20);

/// Which halves of the channel may be used
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    /// Read-only
    In,
    /// Write-only
    Out,
    InOut,
}

impl PipeDirection {
    fn can_read(self) -> bool {
        matches!(self, Self::In | Self::InOut)
    }

    fn can_write(self) -> bool {
        matches!(self, Self::Out | Self::InOut)
    }
}

/// Path of the control socket a target with `pid` listens on.
#[must_use]
pub fn control_socket_path(runtime_dir: &Path, pid: Pid) -> PathBuf {
    runtime_dir.join(format!("{CONTROL_SOCKET_PREFIX}{}.sock", pid.0))
}

/// One connected end of a control channel
#[derive(Debug)]
pub struct ControlChannel {
    stream: Option<UnixStream>,
    direction: PipeDirection,
    /// Bytes received past the end of the last message
    carry: Vec<u8>,
}

impl ControlChannel {
    /// Connect to the socket at `path`, retrying until `timeout` elapses.
    ///
    /// A zero timeout makes exactly one attempt.
    ///
    /// # Errors
    /// `ConnectTimeout` if nothing is listening by the deadline,
    /// `ConnectFailed` for any other I/O error.
    pub fn connect(
        path: impl AsRef<Path>,
        direction: PipeDirection,
        timeout: Duration,
    ) -> Result<Self, ChannelError> {
        let path = path.as_ref();
        let deadline = Instant::now() + timeout;

        loop {
            match UnixStream::connect(path) {
                Ok(stream) => {
                    debug!("Connected control channel {}", path.display());
                    return Ok(Self::from_stream(stream, direction));
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(ChannelError::ConnectTimeout {
                            path: path.to_path_buf(),
                            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        });
                    }
                    thread::sleep(CONNECT_RETRY.min(deadline - now));
                }
                Err(source) => {
                    return Err(ChannelError::ConnectFailed { path: path.to_path_buf(), source });
                }
            }
        }
    }

    /// Wrap an already connected stream (used by the listening side).
    #[must_use]
    pub fn from_stream(stream: UnixStream, direction: PipeDirection) -> Self {
        Self { stream: Some(stream), direction, carry: Vec::new() }
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    #[must_use]
    pub fn direction(&self) -> PipeDirection {
        self.direction
    }

    /// Bound how long a read may block. `None` blocks indefinitely.
    pub fn set_reply_timeout(&self, timeout: Option<Duration>) {
        if let Some(ref stream) = self.stream {
            if let Err(e) = stream.set_read_timeout(timeout) {
                debug!("Failed to set reply timeout: {e}");
            }
        }
    }

    /// Send `text` and read one reply.
    pub fn send_message(&mut self, text: &str) -> Option<String> {
        if !self.write_message(text) {
            return None;
        }
        self.read_message()
    }

    /// Write one text message, truncated to [`MAX_MESSAGE_BYTES`].
    pub fn write_message(&mut self, text: &str) -> bool {
        if !self.direction.can_write() {
            return false;
        }
        let bytes = encode_message(text);
        self.write_all(&bytes)
    }

    /// Read one text message.
    ///
    /// Returns `None` on I/O failure, end of stream, or a reply with no
    /// characters before the terminator. A failed read (including a reply
    /// timeout) closes the channel.
    pub fn read_message(&mut self) -> Option<String> {
        if !self.direction.can_read() {
            return None;
        }

        loop {
            if let Some(end) = find_terminator(&self.carry) {
                let message: Vec<u8> = self.carry.drain(..end + BYTES_PER_CHAR).collect();
                return decode_message(&message);
            }
            if self.carry.len() >= MAX_MESSAGE_BYTES {
                let message: Vec<u8> = self.carry.drain(..MAX_MESSAGE_BYTES).collect();
                return decode_message(&message);
            }

            let mut buf = [0u8; MAX_MESSAGE_BYTES];
            let want = MAX_MESSAGE_BYTES - self.carry.len();
            let stream = self.stream.as_mut()?;
            match stream.read(&mut buf[..want]) {
                Ok(0) => {
                    // Peer closed; whatever arrived unterminated is the last message.
                    let rest = std::mem::take(&mut self.carry);
                    self.close();
                    return decode_message(&rest);
                }
                Ok(n) => self.carry.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    // A reply that arrives after a timeout would answer the
                    // next request, so the connection cannot be reused.
                    debug!("Control channel read failed: {e}");
                    self.close();
                    return None;
                }
            }
        }
    }

    /// Write `[len][bytes]`.
    pub fn write_framed(&mut self, bytes: &[u8]) -> bool {
        if !self.direction.can_write() {
            return false;
        }
        let Ok(len) = u32::try_from(bytes.len()) else {
            return false;
        };
        let mut frame = Vec::with_capacity(FRAME_HEADER_BYTES + bytes.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(bytes);
        self.write_all(&frame)
    }

    /// Read one `[len][bytes]` frame.
    ///
    /// A short read or an implausible length yields `None`.
    pub fn read_framed(&mut self) -> Option<Vec<u8>> {
        if !self.direction.can_read() {
            return None;
        }
        let header = self.read_exact_buffered(FRAME_HEADER_BYTES)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > MAX_FRAME_BYTES {
            debug!("Rejecting {len}-byte frame");
            return None;
        }
        self.read_exact_buffered(len)
    }

    /// Close the connection. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            self.carry.clear();
            debug!("Control channel closed");
        }
    }

    fn write_all(&mut self, bytes: &[u8]) -> bool {
        let Some(stream) = self.stream.as_mut() else {
            return false;
        };
        match stream.write_all(bytes).and_then(|()| stream.flush()) {
            Ok(()) => true,
            Err(e) => {
                debug!("Control channel write failed: {e}");
                self.close();
                false
            }
        }
    }

    fn read_exact_buffered(&mut self, len: usize) -> Option<Vec<u8>> {
        let from_carry = len.min(self.carry.len());
        let mut out: Vec<u8> = self.carry.drain(..from_carry).collect();
        if out.len() < len {
            let stream = self.stream.as_mut()?;
            let start = out.len();
            out.resize(len, 0);
            if let Err(e) = stream.read_exact(&mut out[start..]) {
                debug!("Short frame read: {e}");
                self.close();
                return None;
            }
        }
        Some(out)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Listening end, played by the instrumented target.
///
/// Removes its socket file when dropped.
#[derive(Debug)]
pub struct ControlListener {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlListener {
    /// Bind `path`, replacing a stale socket file left by an earlier run.
    ///
    /// # Errors
    /// Returns an error if the socket cannot be bound.
    pub fn bind(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!("Removed stale socket {}", path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { listener, path })
    }

    /// Wait for the consumer to connect.
    ///
    /// # Errors
    /// Returns an error if `accept` fails.
    pub fn accept(&self) -> io::Result<ControlChannel> {
        let (stream, _) = self.listener.accept()?;
        Ok(ControlChannel::from_stream(stream, PipeDirection::InOut))
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Encode `text` as NUL-terminated UTF-16LE, truncated to the message cap.
fn encode_message(text: &str) -> Vec<u8> {
    let max_units = MAX_MESSAGE_BYTES / BYTES_PER_CHAR - 1;
    let mut bytes = Vec::with_capacity(MAX_MESSAGE_BYTES);
    for unit in text.encode_utf16().take(max_units) {
        bytes.extend_from_slice(&unit.to_le_bytes());
    }
    bytes.extend_from_slice(&[0, 0]);
    bytes
}

/// Byte offset of the first NUL code unit, if any.
fn find_terminator(bytes: &[u8]) -> Option<usize> {
    bytes
        .chunks_exact(BYTES_PER_CHAR)
        .position(|unit| unit == [0, 0])
        .map(|index| index * BYTES_PER_CHAR)
}

fn decode_message(bytes: &[u8]) -> Option<String> {
    if bytes.len() <= BYTES_PER_CHAR {
        return None;
    }
    let mut units: Vec<u16> =
        bytes.chunks_exact(BYTES_PER_CHAR).map(|u| u16::from_le_bytes([u[0], u[1]])).collect();
    while units.last() == Some(&0) {
        units.pop();
    }
    if units.is_empty() {
        return None;
    }
    Some(String::from_utf16_lossy(&units))
}
