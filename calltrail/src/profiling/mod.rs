//! Call stack reconstruction
//!
//! - [`record_lists`]: call records and the free/pending lists that recycle them
//! - [`stack_watcher`]: the background thread that rebuilds the live stack
//! - [`event_display`]: console output for the headless binary

pub mod event_display;
pub mod record_lists;
pub mod stack_watcher;

pub use event_display::{
    display_hot_path, display_statistics, display_watch_event, format_watch_event, WatchStats,
};
pub use record_lists::{CallRecord, FreeList, PendingList, RecordChain};
pub use stack_watcher::{StackFrame, StackWatcher, WatchEvent, WatchFilter};
