//! Error types for rpcmux
//!
//! Only API misuse and setup failures are errors. Operational outcomes of
//! a batch (transport failure, decode failure, timeout, shutdown) travel as
//! the `ok` flag of a completion or as a `Status`.

use thiserror::Error;

use crate::transport::Side;

/// Errors returned when starting or submitting work on a call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The completion queue was shut down; it accepts no new work.
    #[error("completion queue is shut down")]
    QueueShutdown,

    /// A batch of the same direction is already in flight on this call.
    #[error("a {0} batch is already in flight on this call")]
    TooManyOperations(&'static str),

    /// Write flags outside the known mask.
    #[error("invalid write flags {0:#x}")]
    InvalidFlags(u32),

    /// The op is not valid on this side of the call.
    #[error("operation {op} is not valid on a {side} call")]
    WrongSide { op: &'static str, side: Side },

    /// The batch contained no active slot.
    #[error("empty batch")]
    EmptyBatch,

    /// The transport refused to open a stream.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
}

/// Errors from the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed.
    #[error("connection closed")]
    Closed,

    /// Stream ids are 31-bit; the connection ran out.
    #[error("stream id space exhausted")]
    StreamIdsExhausted,
}

/// Message serialization failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),

    #[error("decode failed: {0}")]
    Decode(String),
}
