//! # rpcmux-core
//!
//! Core types for the rpcmux call engine.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Wakeup fds and pollset kicking live in `rpcmux-runtime`; the call
//! facade, blocking helpers and loopback transport live in `rpcmux`.
//!
//! ## Modules
//!
//! - `tag` - Opaque completion identity
//! - `status` - RPC status codes and final call status
//! - `metadata` - Ordered multimap carried as initial/trailing metadata
//! - `codec` - Message serialization trait
//! - `wire` - Transport-facing op codes and op payloads
//! - `stream_map` - Sorted, compactable stream id → stream table
//! - `completion_queue` - Next/Pluck completion queue
//! - `op_set` - Batch builder with per-slot finishers
//! - `transport` - Transport boundary traits
//! - `error` - Error types
//! - `klog` - stderr backend for the `log` facade
//! - `env` - Environment variable utilities

pub mod tag;
pub mod status;
pub mod metadata;
pub mod codec;
pub mod wire;
pub mod stream_map;
pub mod completion_queue;
pub mod op_set;
pub mod transport;
pub mod error;
pub mod klog;
pub mod env;

// Re-exports for convenience
pub use tag::Tag;
pub use status::{Status, StatusCode};
pub use metadata::MetadataMap;
pub use codec::Message;
pub use wire::{OpCode, OpData, RecvCell, WireOp, WireStatus, WriteOptions};
pub use stream_map::StreamMap;
pub use completion_queue::{BatchDone, CompletionHandler, CompletionQueue, Event, InFlightGuard, QueueState};
pub use op_set::{OpSet, Received};
pub use transport::{Side, Transport, TransportStream};
pub use error::{CallError, CodecError, TransportError};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set};

/// Deadline for blocking operations. `None` waits forever.
pub type Deadline = Option<std::time::Instant>;

/// Builds a deadline `timeout` from now.
#[inline]
pub fn deadline_after(timeout: std::time::Duration) -> Deadline {
    Some(std::time::Instant::now() + timeout)
}
