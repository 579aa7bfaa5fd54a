//! Transport between calltrail and the instrumented target
//!
//! - [`control_channel`]: request/response text messages over a Unix socket
//! - [`ring_buffer`]: the shared-memory record stream
//! - [`agent`]: the target's end of the control protocol

#[doc(hidden)]
pub mod agent;
pub mod control_channel;
pub mod ring_buffer;

pub use agent::{serve_agent, AgentHandler};
pub use control_channel::{control_socket_path, ControlChannel, ControlListener, PipeDirection};
pub use ring_buffer::{RecordField, RingReader, RingWriter, SharedRegion, TelemetryBuffer};
