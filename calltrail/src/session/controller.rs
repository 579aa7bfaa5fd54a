//! # Session Controller
//!
//! Owns the control channel and the record buffer for one attached target.
//!
//! ## States
//!
//! ```text
//! Detached ──attach──▶ Attaching ──ok──▶ Attached ──detach / exit──▶ Detached
//!                          │
//!                          └──error──▶ Detached
//! ```
//!
//! While `Attached`, a two-phase command raises `waiting_for_profiler` until
//! its second acknowledgement arrives.
//!
//! ## Locking
//!
//! - `channel`: held for the whole of every request/response exchange, so
//!   only one request is ever outstanding on the socket.
//! - `buffer`: held only for cursor updates. Acquired after `channel` when
//!   both are needed, never the other way round.
//!
//! A round trip that closes the channel (timeout, I/O error, peer gone)
//! detaches the session there and then; replies are never paired with the
//! wrong request.

use calltrail_common::{
    CMD_CLEAR, CMD_DETACH, CMD_GET_COUNTS, SHARED_BUFFER_PREFIX, STATUS_CONCURRENT_GC_NOT_PROFILABLE,
};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::config::SessionConfig;
use super::protocol::{self, Counts};
use super::status::{StatusEvent, StatusNotifier};
use super::target::TargetProcess;
use crate::domain::{MethodId, MethodIdentity, SessionError};
use crate::transport::{
    control_socket_path, ControlChannel, PipeDirection, SharedRegion, TelemetryBuffer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Detached,
    Attaching,
    Attached,
}

/// Connection to one instrumented target.
///
/// Created behind an `Arc` so background threads can hold a `Weak` to it.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    state: Mutex<SessionState>,
    waiting_for_profiler: AtomicBool,
    target: Mutex<Option<TargetProcess>>,
    channel: Mutex<Option<ControlChannel>>,
    buffer: Mutex<Option<TelemetryBuffer>>,
    last_generation: Mutex<Option<u64>>,
    names: DashMap<MethodId, Arc<MethodIdentity>>,
    round_trips: AtomicU64,
    notifier: StatusNotifier,
    exit_watch: Mutex<Option<ExitWatch>>,
}

impl Session {
    #[must_use]
    pub fn new(config: SessionConfig) -> Arc<Self> {
        let notifier = StatusNotifier::new(config.notify_capacity);
        Arc::new(Self {
            config,
            state: Mutex::new(SessionState::Detached),
            waiting_for_profiler: AtomicBool::new(false),
            target: Mutex::new(None),
            channel: Mutex::new(None),
            buffer: Mutex::new(None),
            last_generation: Mutex::new(None),
            names: DashMap::new(),
            round_trips: AtomicU64::new(0),
            notifier,
            exit_watch: Mutex::new(None),
        })
    }

    // ========================================================================
    // Attach / Detach
    // ========================================================================

    /// Attach to `target`: connect its control socket, create the shared
    /// buffer and announce it.
    ///
    /// On failure the session is left `Detached` with nothing allocated.
    ///
    /// # Errors
    /// - `InvalidProcess` when `target` is `None`
    /// - `ProcessHasExited` when it is already gone
    /// - `Busy` when already attached or attaching
    /// - `NoRuntimeToAttachTo` when nothing listens on its control socket
    /// - `ConcurrentGcNotSupported` / `ChannelAnnounceFailed` when the
    ///   target refuses or ignores the buffer announcement
    pub fn attach(self: &Arc<Self>, target: Option<TargetProcess>) -> Result<(), SessionError> {
        let Some(target) = target else {
            self.set_status("Select a process to attach to.");
            return Err(SessionError::InvalidProcess);
        };
        if target.has_exited() {
            self.set_status("Process has exited.");
            return Err(SessionError::ProcessHasExited(target.pid()));
        }
        self.config.validate()?;

        {
            let mut state = self.state.lock();
            if *state != SessionState::Detached || self.is_waiting_for_profiler() {
                return Err(SessionError::Busy("already attached"));
            }
            *state = SessionState::Attaching;
        }

        if let Err(e) = self.connect_and_announce(&target) {
            warn!("Attach to {} failed: {e}", target.pid());
            self.release();
            *self.state.lock() = SessionState::Detached;
            self.set_status(&e.to_string());
            return Err(e);
        }

        if let Err(e) = self.finish_attach(&target) {
            warn!("Attach to {} abandoned: {e}", target.pid());
            self.release();
            return Err(e);
        }

        match ExitWatch::spawn(Arc::downgrade(self), target.clone(), self.config.exit_poll_interval)
        {
            Ok(watch) => *self.exit_watch.lock() = Some(watch),
            Err(e) => warn!("Cannot watch {} for exit: {e}", target.pid()),
        }

        info!("Attached to {} ({})", target.name(), target.pid());
        self.notifier.publish(&StatusEvent::Attached(true));
        self.set_status(&self.attached_info());
        Ok(())
    }

    /// Move `Attaching` to `Attached`, unless a detach got in first.
    fn finish_attach(&self, target: &TargetProcess) -> Result<(), SessionError> {
        let mut state = self.state.lock();
        if *state != SessionState::Attaching {
            return Err(SessionError::Busy("detached while attaching"));
        }
        *self.last_generation.lock() = None;
        *self.target.lock() = Some(target.clone());
        *state = SessionState::Attached;
        Ok(())
    }

    fn connect_and_announce(&self, target: &TargetProcess) -> Result<(), SessionError> {
        let pid = target.pid();
        let socket = control_socket_path(&self.config.runtime_dir, pid);
        let channel =
            ControlChannel::connect(&socket, PipeDirection::InOut, self.config.connect_timeout)
                .map_err(|source| SessionError::NoRuntimeToAttachTo { pid, source })?;
        channel.set_reply_timeout(self.config.reply_timeout);

        let name = format!("{SHARED_BUFFER_PREFIX}{}-{}", pid.0, std::process::id());
        let region = SharedRegion::create(&self.config.shm_dir, &name, self.config.buffer_size)?;
        let announce = protocol::announce_buffer(region.path(), region.len());
        let buffer = TelemetryBuffer::for_target(region, target.is_64bit());

        let mut guard = self.channel.lock();
        *guard = Some(channel);
        *self.buffer.lock() = Some(buffer);

        let Some(reply) = self.round_trip(&mut guard, &announce) else {
            return Err(SessionError::ChannelAnnounceFailed(
                "no acknowledgement from target".to_string(),
            ));
        };
        match protocol::parse_refusal(&reply) {
            None => Ok(()),
            Some(STATUS_CONCURRENT_GC_NOT_PROFILABLE) => Err(SessionError::ConcurrentGcNotSupported),
            Some(code) => {
                Err(SessionError::ChannelAnnounceFailed(format!("target refused with {code:#010x}")))
            }
        }
    }

    /// Ask the target to detach, then release the channel and the buffer.
    ///
    /// Resources are released even when the target does not answer.
    /// Detaching a detached session does nothing.
    ///
    /// # Errors
    /// `MalformedReply` when either acknowledgement is missing.
    pub fn detach(&self) -> Result<(), SessionError> {
        let detached = self.state() == SessionState::Detached;
        if detached && self.channel.lock().is_none() {
            return Ok(());
        }
        self.stop_exit_watch();

        let mut result = Ok(());
        {
            let mut guard = self.channel.lock();
            if guard.as_ref().is_some_and(ControlChannel::is_connected)
                && !self.send_two_phase(&mut guard, CMD_DETACH)
            {
                result = Err(SessionError::MalformedReply {
                    command: CMD_DETACH.to_string(),
                    reply: None,
                });
            }
            if let Some(mut channel) = guard.take() {
                channel.close();
            }
        }
        self.finish_detach();
        info!("Detached");
        result
    }

    fn on_target_exited(&self) {
        warn!("Target exited, detaching");
        self.set_status("Process has exited.");
        self.stop_exit_watch();
        if let Some(mut channel) = self.channel.lock().take() {
            channel.close();
        }
        self.finish_detach();
    }

    fn finish_detach(&self) {
        self.release();
        self.mark_detached();
    }

    /// The channel died mid-exchange. Runs with the channel lock held, so
    /// it must not touch the channel or wait for the exit watch.
    fn on_connection_lost(&self) {
        if self.state() != SessionState::Attached {
            return;
        }
        warn!("Control channel to target lost, detaching");
        self.set_status("Lost connection to target.");
        let watch = self.exit_watch.lock().take();
        if let Some(watch) = watch {
            watch.cancel();
        }
        *self.buffer.lock() = None;
        self.mark_detached();
    }

    fn mark_detached(&self) {
        *self.target.lock() = None;
        let was_attached =
            std::mem::replace(&mut *self.state.lock(), SessionState::Detached) != SessionState::Detached;
        if was_attached {
            self.notifier.publish(&StatusEvent::Attached(false));
        }
    }

    /// Drop the channel and the buffer (removing the shared region file).
    fn release(&self) {
        if let Some(mut channel) = self.channel.lock().take() {
            channel.close();
        }
        *self.buffer.lock() = None;
    }

    fn stop_exit_watch(&self) {
        let watch = self.exit_watch.lock().take();
        if let Some(watch) = watch {
            watch.stop();
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    /// Query `functions,calls,generation` and update the read window.
    ///
    /// A generation different from the last one seen means the target reset
    /// its buffer, so the cursor wraps to 0.
    ///
    /// # Errors
    /// `NotAttached`, or `MalformedReply` for a missing or unparsable reply.
    pub fn get_counts(&self) -> Result<Counts, SessionError> {
        let mut guard = self.channel.lock();
        if guard.is_none() {
            return Err(SessionError::NotAttached);
        }
        let Some(reply) = self.round_trip(&mut guard, CMD_GET_COUNTS) else {
            self.set_status("Failed to get result.");
            return Err(SessionError::MalformedReply {
                command: CMD_GET_COUNTS.to_string(),
                reply: None,
            });
        };
        let counts = protocol::parse_counts(&reply).ok_or_else(|| SessionError::MalformedReply {
            command: CMD_GET_COUNTS.to_string(),
            reply: Some(reply.clone()),
        })?;

        let mut buffer = self.buffer.lock();
        let buffer = buffer.as_mut().ok_or(SessionError::NotAttached)?;
        buffer.set_logical_size(counts.calls);

        let mut last = self.last_generation.lock();
        if last.is_some_and(|seen| seen != counts.generation) {
            info!("Target buffer reset (generation {}), wrapping around", counts.generation);
            buffer.set_logical_size(0);
        }
        *last = Some(counts.generation);
        Ok(counts)
    }

    /// Identity of method `id`, asking the target on a cache miss.
    ///
    /// Concurrent misses for the same id cost one round trip: the cache is
    /// checked again once the channel is held. `None` if the target gives
    /// no name.
    pub fn resolve_method_name(&self, id: MethodId) -> Option<Arc<MethodIdentity>> {
        if let Some(identity) = self.cached_method(id) {
            return Some(identity);
        }

        let mut guard = self.channel.lock();
        if let Some(identity) = self.cached_method(id) {
            return Some(identity);
        }
        let name = self.round_trip(&mut guard, &protocol::function_name(id))?;
        let identity = Arc::new(MethodIdentity::new(id, name));
        self.names.insert(id, Arc::clone(&identity));
        Some(identity)
    }

    /// Cache lookup without a round trip.
    #[must_use]
    pub fn cached_method(&self, id: MethodId) -> Option<Arc<MethodIdentity>> {
        self.names.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Tell the target to discard its history, then rewind.
    ///
    /// # Errors
    /// `NotAttached`, or `MalformedReply` if the target does not acknowledge
    /// (the cursor is rewound regardless).
    pub fn clear(&self) -> Result<(), SessionError> {
        let mut guard = self.channel.lock();
        if guard.is_none() {
            return Err(SessionError::NotAttached);
        }
        let reply = self.round_trip(&mut guard, CMD_CLEAR);
        if let Some(buffer) = self.buffer.lock().as_mut() {
            buffer.move_to(0);
        }
        if reply.is_none() {
            self.set_status("Failed to get result.");
            return Err(SessionError::MalformedReply { command: CMD_CLEAR.to_string(), reply: None });
        }
        Ok(())
    }

    /// Replay the buffer from the start without telling the target.
    pub fn rewind(&self) {
        if let Some(buffer) = self.buffer.lock().as_mut() {
            buffer.move_to(0);
        }
    }

    /// Force the cursor back to 0 by shrinking the read window to nothing.
    pub fn wrap_around(&self) {
        if let Some(buffer) = self.buffer.lock().as_mut() {
            buffer.set_logical_size(0);
        }
    }

    /// Next `(id, timestamp)` record; `(0, 0)` when nothing is readable.
    ///
    /// # Errors
    /// `NotAttached` once the buffer has been released.
    pub fn read_method(&self) -> Result<(u64, u64), SessionError> {
        let mut buffer = self.buffer.lock();
        let buffer = buffer.as_mut().ok_or(SessionError::NotAttached)?;
        Ok(buffer.read_record())
    }

    // Caller holds the channel lock for the whole exchange.
    fn round_trip(&self, channel: &mut Option<ControlChannel>, message: &str) -> Option<String> {
        let live = channel.as_mut()?;
        self.round_trips.fetch_add(1, Ordering::Relaxed);
        let reply = live.send_message(message);
        if reply.is_none() && !live.is_connected() {
            *channel = None;
            self.on_connection_lost();
        }
        reply
    }

    fn send_two_phase(&self, channel: &mut Option<ControlChannel>, message: &str) -> bool {
        self.set_waiting(true);
        let begin = Instant::now();

        let done = if self.round_trip(channel, message).is_none() {
            self.set_status("Message send failed.");
            false
        } else {
            self.set_status("Profiler received message. Waiting for data.");
            if channel.as_mut().and_then(ControlChannel::read_message).is_some() {
                self.set_status(&format!(
                    "Finished {message}. Took {:.2} seconds",
                    begin.elapsed().as_secs_f64()
                ));
                true
            } else {
                self.set_status("Failed to read second ack.");
                false
            }
        };

        self.set_waiting(false);
        done
    }

    // ========================================================================
    // Observers
    // ========================================================================

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        self.notifier.subscribe()
    }

    /// Latest status line
    #[must_use]
    pub fn status(&self) -> String {
        self.notifier.status()
    }

    fn set_status(&self, text: &str) {
        self.notifier.set_status(text);
    }

    fn set_waiting(&self, waiting: bool) {
        self.waiting_for_profiler.store(waiting, Ordering::SeqCst);
        self.notifier.publish(&StatusEvent::WaitingForProfiler(waiting));
    }

    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.state() == SessionState::Attached
    }

    #[must_use]
    pub fn is_waiting_for_profiler(&self) -> bool {
        self.waiting_for_profiler.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn can_attach(&self) -> bool {
        !self.is_attached() && !self.is_waiting_for_profiler()
    }

    #[must_use]
    pub fn can_detach(&self) -> bool {
        self.is_attached() && !self.is_waiting_for_profiler()
    }

    #[must_use]
    pub fn attached_info(&self) -> String {
        match (self.is_attached(), self.target.lock().as_ref()) {
            (true, Some(target)) => format!("Attached to: {} ({})", target.name(), target.pid().0),
            _ => "Not attached.".to_string(),
        }
    }

    #[must_use]
    pub fn target(&self) -> Option<TargetProcess> {
        self.target.lock().clone()
    }

    /// Number of control requests sent so far
    #[must_use]
    pub fn round_trips(&self) -> u64 {
        self.round_trips.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.detach() {
            warn!("Detach on drop failed: {e}");
        }
    }
}

// ============================================================================
// Exit Watch
// ============================================================================

/// Polls the target and detaches the session when it exits.
#[derive(Debug)]
struct ExitWatch {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

impl ExitWatch {
    fn spawn(
        session: Weak<Session>,
        target: TargetProcess,
        interval: Duration,
    ) -> std::io::Result<Self> {
        let (stop, stopped): (Sender<()>, Receiver<()>) = bounded(1);
        let handle = thread::Builder::new().name("calltrail-exit-watch".to_string()).spawn(
            move || loop {
                match stopped.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
                }
                if target.has_exited() {
                    if let Some(session) = session.upgrade() {
                        session.on_target_exited();
                    }
                    return;
                }
            },
        )?;
        Ok(Self { stop, handle })
    }

    /// Signal the thread without waiting for it.
    fn cancel(self) {
        drop(self.stop);
    }

    fn stop(self) {
        drop(self.stop);
        // The watch thread itself lands here via on_target_exited.
        if self.handle.thread().id() != thread::current().id() {
            let _ = self.handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{codes, Pid};

    fn scratch_config(dir: &std::path::Path) -> SessionConfig {
        SessionConfig {
            runtime_dir: dir.to_path_buf(),
            shm_dir: dir.to_path_buf(),
            buffer_size: 4096,
            connect_timeout: Duration::ZERO,
            ..SessionConfig::default()
        }
    }

    #[test]
    fn test_fresh_session_is_detached() {
        let session = Session::new(SessionConfig::default());
        assert_eq!(session.state(), SessionState::Detached);
        assert_eq!(session.attached_info(), "Not attached.");
        assert!(session.can_attach());
        assert!(!session.can_detach());
    }

    #[test]
    fn test_detach_when_detached_is_noop() {
        let session = Session::new(SessionConfig::default());
        assert!(session.detach().is_ok());
        assert!(session.detach().is_ok());
        assert_eq!(session.round_trips(), 0);
    }

    #[test]
    fn test_attach_without_process() {
        let session = Session::new(SessionConfig::default());
        let err = session.attach(None).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_PROCESS);
        assert!(session.status().ends_with("Select a process to attach to."));
    }

    #[test]
    fn test_attach_to_exited_process() {
        let session = Session::new(SessionConfig::default());
        let gone = TargetProcess::from_parts(Pid(999_999_999), "gone", true);
        let err = session.attach(Some(gone)).unwrap_err();
        assert!(matches!(err, SessionError::ProcessHasExited(Pid(999_999_999))));
        assert_eq!(session.state(), SessionState::Detached);
    }

    #[test]
    fn test_attach_without_listener_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let session = Session::new(scratch_config(dir.path()));
        let err = session.attach(Some(TargetProcess::current())).unwrap_err();
        assert_eq!(err.code(), codes::NO_RUNTIME_TO_ATTACH_TO);
        assert_eq!(session.state(), SessionState::Detached);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_detach_during_attach_is_not_overwritten() {
        let session = Session::new(SessionConfig::default());
        let target = TargetProcess::current();

        *session.state.lock() = SessionState::Attaching;
        session.detach().unwrap();
        let err = session.finish_attach(&target).unwrap_err();
        assert!(matches!(err, SessionError::Busy(_)));
        assert_eq!(session.state(), SessionState::Detached);
        assert!(session.target().is_none());

        *session.state.lock() = SessionState::Attaching;
        session.finish_attach(&target).unwrap();
        assert_eq!(session.state(), SessionState::Attached);
        assert_eq!(session.target().map(|t| t.pid()), Some(target.pid()));
        *session.state.lock() = SessionState::Detached;
    }

    #[test]
    fn test_commands_require_attachment() {
        let session = Session::new(SessionConfig::default());
        assert!(matches!(session.get_counts(), Err(SessionError::NotAttached)));
        assert!(matches!(session.clear(), Err(SessionError::NotAttached)));
        assert!(matches!(session.read_method(), Err(SessionError::NotAttached)));
        assert!(session.resolve_method_name(MethodId(10)).is_none());
        session.rewind();
        session.wrap_around();
    }

    #[test]
    fn test_invalid_config_rejected_before_connecting() {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionConfig { buffer_size: 0, ..scratch_config(dir.path()) };
        let session = Session::new(config);
        let err = session.attach(Some(TargetProcess::current())).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_CONFIGURATION);
    }
}
