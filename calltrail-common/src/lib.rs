//! # Shared Wire Definitions (Target ↔ Consumer)
//!
//! Constants shared between the instrumented target process and the
//! consumer that reads its telemetry. Both sides must agree on these values
//! byte for byte: the record layout of the shared buffer, the reserved
//! method ids, and the control message prefixes.
//!
//! ## Key Items
//!
//! - [`LEAVE_METHOD`] / [`TAIL_CALL`] - reserved ids in the record stream
//! - [`MAX_MESSAGE_BYTES`] - cap on a single control message
//! - [`CMD_ANNOUNCE_BUFFER`], [`CMD_GET_COUNTS`], [`CMD_FUNCTION_NAME`],
//!   [`CMD_CLEAR`], [`CMD_DETACH`] - control protocol commands

#![no_std]

// ============================================================================
// Record Stream
// ============================================================================

/// Reserved id: the most recently entered method returned.
pub const LEAVE_METHOD: u64 = 1;

/// Reserved id: the most recently entered method left through a tail call.
///
/// The consumer treats this exactly like [`LEAVE_METHOD`].
pub const TAIL_CALL: u64 = 2;

/// An id field of zero marks a slot the producer has not finished writing.
pub const EMPTY_SLOT: u64 = 0;

/// Number of fields per record: `[method id][timestamp]`.
pub const FIELDS_PER_RECORD: usize = 2;

/// Field width for 32-bit targets, in bytes.
pub const NARROW_FIELD_BYTES: usize = 4;

/// Field width for 64-bit targets, in bytes.
pub const WIDE_FIELD_BYTES: usize = 8;

/// Default size of the shared record buffer (400 MB).
pub const DEFAULT_BUFFER_BYTES: usize = 400_000_000;

// ============================================================================
// Control Protocol
// ============================================================================

/// Upper bound for one text message in either direction, terminator included.
///
/// Text travels as UTF-16LE code units followed by one NUL code unit.
pub const MAX_MESSAGE_BYTES: usize = 512;

/// Bytes per UTF-16 code unit.
pub const BYTES_PER_CHAR: usize = 2;

/// `M:<buffer name>,<buffer size>` - announce the shared buffer (single ack).
pub const CMD_ANNOUNCE_BUFFER: &str = "M:";

/// `C:GetCounts` - reply `functions,calls,generation` (single ack).
pub const CMD_GET_COUNTS: &str = "C:GetCounts";

/// `F:<method id>` - reply is the fully qualified method name (single ack).
pub const CMD_FUNCTION_NAME: &str = "F:";

/// `X:` - clear the buffer (single ack).
pub const CMD_CLEAR: &str = "X:";

/// `Detach` - two acks: `ok` on receipt, `detached` when done.
pub const CMD_DETACH: &str = "Detach";

/// Prefix of a refusal reply, followed by a hex status code.
pub const REPLY_ERROR_PREFIX: &str = "E:";

/// Plain acknowledgement.
pub const REPLY_OK: &str = "ok";

/// Second acknowledgement of [`CMD_DETACH`].
pub const REPLY_DETACHED: &str = "detached";

/// File name prefix of a target's control socket; the pid and `.sock` follow.
pub const CONTROL_SOCKET_PREFIX: &str = "calltrail-control-";

/// File name prefix of the shared record buffer; the pid follows.
pub const SHARED_BUFFER_PREFIX: &str = "calltrail-data-";

// ============================================================================
// Status Codes
// ============================================================================

/// Returned by the target when it cannot profile a concurrent-GC runtime.
pub const STATUS_CONCURRENT_GC_NOT_PROFILABLE: u32 = 0x8013_1376;

/// Returned by the target when another profiler is already active.
pub const STATUS_PROFILER_ALREADY_ACTIVE: u32 = 0x8013_136A;
