//! # rpcmux - multiplexed RPC call engine
//!
//! Calls are driven by submitting batches of ops and waiting on a
//! completion queue for the batch's tag. Many calls share one connection;
//! each call is one stream on it.
//!
//! ## Quick Start
//!
//! ```ignore
//! use rpcmux::{blocking_unary_call, Channel, ClientContext, Connection, ServerCall};
//!
//! let conn = Connection::new()?;
//! let listener = conn.listener();
//! let channel = Channel::new(Arc::new(conn.clone()))?;
//!
//! std::thread::spawn(move || {
//!     let incoming = listener.accept(None).unwrap();
//!     let mut call = ServerCall::new(incoming);
//!     let req: String = call.read().unwrap();
//!     call.write(&req.to_uppercase());
//!     call.finish(&Status::ok(), MetadataMap::new());
//! });
//!
//! let ctx = ClientContext::new();
//! let resp: String = blocking_unary_call(&channel, "/echo.Echo/Upper", &ctx, &"hi".to_string())?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │        blocking helpers (unary, reader, writer, bidi)       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │  OpSet + Tag
//!                              ▼
//! ┌──────────────────────────┐      ┌──────────────────────────┐
//! │  Call::perform_ops       │─────▶│  TransportStream          │
//! │  validation, guards      │      │  (loopback connection)    │
//! └──────────────────────────┘      └──────────────────────────┘
//!              ▲                                 │ BatchDone
//!              │ pluck / next                    ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    CompletionQueue                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod call;
pub mod channel;
pub mod loopback;
pub mod blocking;

pub use call::{Call, ClientContext};
pub use channel::Channel;
pub use loopback::{Connection, IncomingCall, Listener};
pub use blocking::{
    blocking_unary_call, ClientReader, ClientReaderWriter, ClientWriter, ServerCall,
};

// Re-export core types
pub use rpcmux_core::{
    deadline_after, BatchDone, CallError, CodecError, CompletionHandler, CompletionQueue,
    Deadline, Event, Message, MetadataMap, OpCode, OpSet, QueueState, Received, Side, Status,
    StatusCode, StreamMap, Tag, Transport, TransportError, TransportStream, WriteOptions,
};

// Re-export logging setup
pub use rpcmux_core::klog::{init as init_logging, set_flush_enabled, set_log_level};

// Re-export env utilities
pub use rpcmux_core::{env_get, env_get_bool, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use rpcmux_runtime::{
    ConfigError, KickFdInfo, MuxConfig, PollOutcome, Pollset, PollsetKick, PrePoll,
    WakeupFdPool,
};
