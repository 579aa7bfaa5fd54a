//! Domain model for calltrail
//!
//! This module contains core domain types and errors that provide:
//! - Compile-time safety via newtype pattern
//! - Self-documenting function signatures
//! - Structured error handling

pub mod errors;
pub mod method;
pub mod types;

// Re-export common types for convenience
pub use method::{MethodIdentity, GLOBAL_NAMESPACE};
pub use types::{MethodId, Pid};

pub use errors::{codes, ChannelError, ExportError, SessionError};
