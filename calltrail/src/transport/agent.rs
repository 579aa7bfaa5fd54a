//! # Agent Side
//!
//! The target's end of the control protocol. Instrumented processes
//! implement it natively; calltrail only needs it for stand-in targets
//! (the synthetic demo target and the integration test fixtures).
//!
//! [`serve_agent`] owns the wire handling and command dispatch, an
//! [`AgentHandler`] owns the state behind it.

use calltrail_common::{
    CMD_ANNOUNCE_BUFFER, CMD_CLEAR, CMD_DETACH, CMD_FUNCTION_NAME, CMD_GET_COUNTS,
    REPLY_DETACHED, REPLY_ERROR_PREFIX, REPLY_OK,
};
use log::{debug, warn};

use super::control_channel::ControlChannel;
use super::ring_buffer::SharedRegion;

/// Unrecognized command
pub const ERROR_INVALID_FUNCTION: u32 = 0x1;
/// Announced region cannot be mapped
pub const ERROR_FILE_NOT_FOUND: u32 = 0x2;
/// Announcement without a `<path>,<size>` payload
pub const ERROR_INVALID_PARAMETER: u32 = 0x57;

/// State behind one target's control socket.
///
/// Methods take `&self` so a handler may be shared with the threads that
/// produce records; each implementation does its own locking.
pub trait AgentHandler {
    /// Start recording into `region`. `Err(code)` is sent back as `E:<code>`.
    fn announce(&self, region: SharedRegion) -> Result<(), u32>;

    /// `(functions, calls, generation)`
    fn counts(&self) -> (u64, u64, u64);

    /// `None` is sent as an empty name.
    fn function_name(&self, id: u64) -> Option<String>;

    fn clear(&self);

    /// Stop recording and drop the region.
    fn detach(&self);

    /// Called with every message before it is dispatched.
    fn received(&self, _message: &str) {}
}

/// Answer requests on `channel` until the peer hangs up.
pub fn serve_agent<H: AgentHandler + ?Sized>(mut channel: ControlChannel, handler: &H) {
    while let Some(message) = channel.read_message() {
        handler.received(&message);

        let delivered = if let Some(announce) = message.strip_prefix(CMD_ANNOUNCE_BUFFER) {
            let reply = match open_announced(announce).and_then(|region| handler.announce(region)) {
                Ok(()) => REPLY_OK.to_string(),
                Err(code) => refusal(code),
            };
            channel.write_message(&reply)
        } else if message == CMD_GET_COUNTS {
            let (functions, calls, generation) = handler.counts();
            channel.write_message(&format!("{functions},{calls},{generation}"))
        } else if let Some(id) = message.strip_prefix(CMD_FUNCTION_NAME) {
            let name = id.parse::<u64>().ok().and_then(|id| handler.function_name(id));
            channel.write_message(name.as_deref().unwrap_or_default())
        } else if message == CMD_CLEAR {
            handler.clear();
            channel.write_message(REPLY_OK)
        } else if message == CMD_DETACH {
            let first = channel.write_message(REPLY_OK);
            handler.detach();
            first && channel.write_message(REPLY_DETACHED)
        } else {
            channel.write_message(&refusal(ERROR_INVALID_FUNCTION))
        };

        if !delivered {
            debug!("Reply to {message:?} not delivered");
        }
    }
}

fn open_announced(payload: &str) -> Result<SharedRegion, u32> {
    let Some((path, size)) = payload.rsplit_once(',') else {
        return Err(ERROR_INVALID_PARAMETER);
    };
    if size.trim().parse::<usize>().is_err() {
        return Err(ERROR_INVALID_PARAMETER);
    }
    SharedRegion::open(path).map_err(|e| {
        warn!("Cannot map announced buffer {path}: {e}");
        ERROR_FILE_NOT_FOUND
    })
}

fn refusal(code: u32) -> String {
    format!("{REPLY_ERROR_PREFIX}{code:x}")
}
