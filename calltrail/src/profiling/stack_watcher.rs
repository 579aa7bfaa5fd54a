//! # Stack Reconstruction
//!
//! A background thread turns the flat record stream back into a call stack.
//!
//! ## Per Record
//!
//! - `0`: nothing readable yet, back off for `idle_backoff`
//! - `LEAVE_METHOD` / `TAIL_CALL`: pop, stamp the elapsed time, queue as pending
//! - anything else: resolve the name, push
//!
//! ## Watching
//!
//! When the watched method is entered, the whole live stack is published as
//! [`WatchEvent::ShowStack`] and its depth remembered. Deeper enters and
//! leaves are then published one at a time until the stack unwinds below
//! that depth.
//!
//! Completed calls wait in a [`PendingList`] until [`StackWatcher::batch_update`]
//! folds them into a [`CallGraph`] and recycles them.

use calltrail_common::{LEAVE_METHOD, TAIL_CALL};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use log::{debug, info};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::record_lists::{CallRecord, FreeList, PendingList, RecordChain};
use crate::analysis::CallGraph;
use crate::domain::{MethodId, MethodIdentity};
use crate::session::Session;

/// Snapshot of one live frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    pub method: Arc<MethodIdentity>,
    pub timestamp: u64,
    /// Zero until the frame has returned
    pub elapsed: u64,
}

impl From<&CallRecord> for StackFrame {
    fn from(record: &CallRecord) -> Self {
        Self {
            method: Arc::clone(record.method()),
            timestamp: record.timestamp(),
            elapsed: record.elapsed(),
        }
    }
}

/// Incremental updates about the watched method's stack
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// The watched method was entered; frames run from top to bottom.
    ShowStack(Vec<StackFrame>),
    /// A call was made somewhere above the watched frame.
    Enter { caller: Option<StackFrame>, callee: StackFrame },
    /// A frame above (or at) the watched frame returned.
    Exit { exiting: Option<StackFrame>, back_to: Option<StackFrame> },
}

/// Which method to watch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchFilter {
    Method(MethodId),
    /// Matches the fully qualified name or the short name
    Named(String),
}

impl WatchFilter {
    #[must_use]
    pub fn matches(&self, method: &MethodIdentity) -> bool {
        match self {
            Self::Method(id) => method.id() == *id,
            Self::Named(name) => method.full_name() == name || method.name() == name,
        }
    }
}

/// State shared between the handle and the reconstruction thread
#[derive(Debug)]
struct Shared {
    session: Weak<Session>,
    free: FreeList,
    pending: PendingList,
    watching: RwLock<Option<WatchFilter>>,
    calls_read: AtomicU64,
    depth: AtomicUsize,
    dropped_events: AtomicU64,
    rewind_requested: AtomicBool,
    events: Sender<WatchEvent>,
    idle_backoff: Duration,
}

/// Handle to a running reconstruction thread. Stops the thread on drop.
#[derive(Debug)]
pub struct StackWatcher {
    shared: Arc<Shared>,
    events: Receiver<WatchEvent>,
    cancel: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl StackWatcher {
    /// Start reading `session`'s record buffer.
    ///
    /// The thread exits on its own once the session detaches or is dropped.
    ///
    /// # Errors
    /// Returns an error if the thread cannot be spawned.
    pub fn start(session: &Arc<Session>) -> std::io::Result<Self> {
        let config = session.config();
        let (events_tx, events) = bounded(config.notify_capacity.max(1));
        let shared = Arc::new(Shared {
            session: Arc::downgrade(session),
            free: FreeList::new(),
            pending: PendingList::new(),
            watching: RwLock::new(None),
            calls_read: AtomicU64::new(0),
            depth: AtomicUsize::new(0),
            dropped_events: AtomicU64::new(0),
            rewind_requested: AtomicBool::new(false),
            events: events_tx,
            idle_backoff: config.idle_backoff,
        });

        let (cancel, cancelled) = bounded::<()>(1);
        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("calltrail-stack-watcher".to_string())
            .spawn(move || worker.read_calls(&cancelled))?;

        Ok(Self { shared, events, cancel: Some(cancel), handle: Some(handle) })
    }

    /// Watch `filter` (or nothing). Takes effect at the next enter.
    pub fn set_watching(&self, filter: Option<WatchFilter>) {
        *self.shared.watching.write() = filter;
    }

    #[must_use]
    pub fn watching(&self) -> Option<WatchFilter> {
        self.shared.watching.read().clone()
    }

    /// Receiver for [`WatchEvent`]s. Events are dropped when it falls behind.
    #[must_use]
    pub fn watch_events(&self) -> Receiver<WatchEvent> {
        self.events.clone()
    }

    /// Enter and leave records consumed since start (or the last rewind)
    #[must_use]
    pub fn calls_read(&self) -> u64 {
        self.shared.calls_read.load(Ordering::Relaxed)
    }

    /// Depth of the live stack after the last record
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.shared.depth.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.shared.pending.len()
    }

    #[must_use]
    pub fn free_len(&self) -> usize {
        self.shared.free.len()
    }

    /// Records allocated because the free list was empty
    #[must_use]
    pub fn allocations(&self) -> usize {
        self.shared.free.allocations()
    }

    #[must_use]
    pub fn dropped_events(&self) -> u64 {
        self.shared.dropped_events.load(Ordering::Relaxed)
    }

    /// Replay the record buffer from the start.
    ///
    /// Takes effect at the thread's next iteration: the cursor moves to 0,
    /// the live stack and pending records are discarded and `calls_read`
    /// starts over.
    pub fn rewind(&self) {
        self.shared.rewind_requested.store(true, Ordering::SeqCst);
    }

    /// Fold pending records into `graph` and recycle them.
    ///
    /// Returns the number of records aggregated.
    pub fn batch_update(&self, graph: &CallGraph) -> usize {
        let chain = self.shared.pending.drain_all();
        let count = chain.len();
        if count > 0 {
            graph.aggregate(&chain);
            self.shared.free.return_all(chain);
        }
        count
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the thread and wait for it. Safe to call more than once.
    pub fn stop(&mut self) {
        drop(self.cancel.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                debug!("Stack watcher thread panicked");
            }
        }
    }
}

impl Drop for StackWatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

impl Shared {
    fn read_calls(&self, cancelled: &Receiver<()>) {
        let mut stack: Vec<Box<CallRecord>> = Vec::new();
        // Depth of the watched frame while a watch is active
        let mut location: Option<usize> = None;

        loop {
            match cancelled.try_recv() {
                Err(TryRecvError::Empty) => {}
                Ok(()) | Err(TryRecvError::Disconnected) => break,
            }

            let Some(session) = self.session.upgrade() else {
                break;
            };

            if self.rewind_requested.swap(false, Ordering::SeqCst) {
                session.rewind();
                self.free.return_all(stack.drain(..).collect());
                self.free.return_all(self.pending.drain_all());
                self.calls_read.store(0, Ordering::Relaxed);
                self.depth.store(0, Ordering::Relaxed);
                location = None;
            }
            let (id, timestamp) = match session.read_method() {
                Ok(record) => record,
                Err(e) => {
                    debug!("Stack watcher stopping: {e}");
                    break;
                }
            };

            match id {
                0 => {
                    drop(session);
                    match cancelled.recv_timeout(self.idle_backoff) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                LEAVE_METHOD | TAIL_CALL => self.leave(&mut stack, &mut location, timestamp),
                _ => self.enter(&session, &mut stack, &mut location, MethodId(id), timestamp),
            }
        }

        self.free.return_all(stack.into_iter().collect::<RecordChain>());
        self.depth.store(0, Ordering::Relaxed);
        info!("Stack watcher stopped after {} records", self.calls_read.load(Ordering::Relaxed));
    }

    fn enter(
        &self,
        session: &Session,
        stack: &mut Vec<Box<CallRecord>>,
        location: &mut Option<usize>,
        id: MethodId,
        timestamp: u64,
    ) {
        self.calls_read.fetch_add(1, Ordering::Relaxed);

        let method = session
            .resolve_method_name(id)
            .unwrap_or_else(|| Arc::new(MethodIdentity::unresolved(id)));
        let previous = stack.last().map(|top| StackFrame::from(&**top));
        let caller = previous.as_ref().map(|frame| Arc::clone(&frame.method));

        let record = self.free.take(CallRecord::new(method, caller, timestamp));
        let callee = StackFrame::from(&*record);
        stack.push(record);
        self.depth.store(stack.len(), Ordering::Relaxed);

        let watched = self.watching.read().as_ref().is_some_and(|w| w.matches(&callee.method));
        if watched {
            *location = Some(stack.len());
            let frames = stack.iter().rev().map(|r| StackFrame::from(&**r)).collect();
            self.notify(WatchEvent::ShowStack(frames));
        } else if location.is_some() {
            self.notify(WatchEvent::Enter { caller: previous, callee });
        }
    }

    fn leave(&self, stack: &mut Vec<Box<CallRecord>>, location: &mut Option<usize>, timestamp: u64) {
        self.calls_read.fetch_add(1, Ordering::Relaxed);

        // An empty stack here means we started (or wrapped) mid-call.
        let exiting = stack.pop().map(|mut record| {
            record.complete(timestamp);
            let frame = StackFrame::from(&*record);
            self.pending.push(record);
            frame
        });
        self.depth.store(stack.len(), Ordering::Relaxed);

        if let Some(watch_depth) = *location {
            if stack.len() < watch_depth {
                *location = None;
            } else {
                let back_to = stack.last().map(|top| StackFrame::from(&**top));
                self.notify(WatchEvent::Exit { exiting, back_to });
            }
        }
    }

    fn notify(&self, event: WatchEvent) {
        match self.events.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                self.dropped_events.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}
