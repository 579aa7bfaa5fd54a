//! # calltrail - Live Call Tracing for Instrumented Processes
//!
//! calltrail attaches to a running process that carries an instrumentation
//! agent, receives a stream of method enter/leave records through shared
//! memory, rebuilds the live call stack and aggregates a call graph with
//! per-method call counts and elapsed time.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                  Instrumented Target Process                    │
//! │        (agent: control socket + record producer)                │
//! └──────────────┬─────────────────────────────┬────────────────────┘
//!                │ control messages            │ [id][timestamp] records
//!                │ (Unix socket, UTF-16)       │ (shared memory file)
//!                ▼                             ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    calltrail (This Crate)                       │
//! │                                                                 │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │   Session    │──▶│    Stack     │──▶│  Call Graph  │         │
//! │  │ (attach/cmd) │   │   Watcher    │   │  (analysis)  │         │
//! │  └──────────────┘   └──────────────┘   └──────────────┘         │
//! │         │                   │                  │                │
//! │         ▼                   ▼                  ▼                │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐         │
//! │  │    Status    │   │ Watch events │   │    Export    │         │
//! │  │  notifier    │   │ (stack/enter │   │ (graph.json) │         │
//! │  └──────────────┘   │  /exit)      │   └──────────────┘         │
//! │                     └──────────────┘                            │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Structure
//!
//! - [`transport`]: control socket framing and the shared record buffer
//! - [`session`]: attach/detach state machine, target commands, status
//!   notifications
//! - [`profiling`]: the stack watcher thread and its record lists
//! - [`analysis`]: call graph aggregation, hot path and path finding
//! - [`export`]: JSON graph snapshots
//! - [`domain`]: ids, method identities and error types
//! - [`cli`], [`preflight`], [`process_lookup`]: binary support
//!
//! ## Typical Usage
//!
//! ```bash
//! # Attach by name and print stats every 10 seconds
//! calltrail my-app
//!
//! # Show every stack that reaches a method, stop after a minute
//! calltrail --pid 1234 --watch Worker.Step --duration 60
//!
//! # Save the call graph
//! calltrail my-app --export graph.json
//! ```
//!
//! ## Key Concepts
//!
//! - **Record**: `[method id][timestamp]`, 4 or 8 bytes per field depending
//!   on the target's bitness; ids `1` and `2` mark a leave or tail call
//! - **Logical size**: how many records the target reports as written;
//!   the reader never reads past it
//! - **Generation**: bumped by the target when its buffer wraps; the reader
//!   starts over from offset 0
//! - **Watch**: a method whose stacks are reported live as
//!   [`profiling::WatchEvent`]s

pub mod analysis;
pub mod cli;
pub mod domain;
pub mod export;
pub mod preflight;
pub mod process_lookup;
pub mod profiling;
pub mod session;
pub mod transport;
