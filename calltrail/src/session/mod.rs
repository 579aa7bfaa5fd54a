//! Session control: attaching to one target and talking to it
//!
//! - [`controller`]: the [`Session`] state machine and its commands
//! - [`protocol`]: control message formats
//! - [`status`]: status notifications for observers
//! - [`target`]: the profiled process
//! - [`config`]: tunables

pub mod config;
pub mod controller;
pub mod protocol;
pub mod status;
pub mod target;

pub use config::SessionConfig;
pub use controller::{Session, SessionState};
pub use protocol::Counts;
pub use status::{StatusEvent, StatusNotifier};
pub use target::TargetProcess;
