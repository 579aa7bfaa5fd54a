//! Status notifications for whoever drives the session
//!
//! Each subscriber gets its own bounded channel. A subscriber that falls
//! behind loses events instead of stalling the session, and one that has
//! dropped its receiver is forgotten on the next publish.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::debug;
use parking_lot::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusEvent {
    /// Human-readable progress line, prefixed with `HH:MM:SS`
    Status(String),
    Attached(bool),
    /// A two-phase command is between its first and second acknowledgement
    WaitingForProfiler(bool),
}

#[derive(Debug)]
pub struct StatusNotifier {
    subscribers: Mutex<Vec<Sender<StatusEvent>>>,
    last_status: Mutex<String>,
    capacity: usize,
}

impl StatusNotifier {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            last_status: Mutex::new(String::new()),
            capacity: capacity.max(1),
        }
    }

    pub fn subscribe(&self) -> Receiver<StatusEvent> {
        let (tx, rx) = bounded(self.capacity);
        self.subscribers.lock().push(tx);
        rx
    }

    pub fn publish(&self, event: &StatusEvent) {
        self.subscribers.lock().retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                debug!("Status subscriber is full, dropping event");
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        });
    }

    /// Record and publish a status line.
    pub fn set_status(&self, text: &str) {
        let line = format!("{} {text}", time_of_day(SystemTime::now()));
        debug!("Status: {line}");
        *self.last_status.lock() = line.clone();
        self.publish(&StatusEvent::Status(line));
    }

    /// Most recent status line, empty before the first one
    #[must_use]
    pub fn status(&self) -> String {
        self.last_status.lock().clone()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

/// `HH:MM:SS` in UTC
fn time_of_day(now: SystemTime) -> String {
    let secs = now.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs()) % 86_400;
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}
