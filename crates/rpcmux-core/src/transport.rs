//! Transport boundary.
//!
//! A transport accepts batches of wire ops against one stream and reports
//! each batch's completion exactly once through the `BatchDone` it was
//! handed. Framing, flow control and header compression are the
//! transport's business; this crate only coordinates around them.

use std::fmt;
use std::sync::Arc;

use crate::completion_queue::BatchDone;
use crate::error::TransportError;
use crate::status::Status;
use crate::wire::WireOp;
use crate::Deadline;

/// Which end of a call this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Client => f.write_str("client"),
            Side::Server => f.write_str("server"),
        }
    }
}

/// One multiplexed stream on a connection.
///
/// # Contract
///
/// - `start_batch` must not block. Send ops are applied in order; receive
///   ops are satisfied as data arrives.
/// - `done` completes exactly once per batch, possibly from another thread.
///   Dropping it without completing reports failure.
/// - `cancel` is best effort and never blocks; every outstanding batch
///   still completes (usually with `ok = false`).
pub trait TransportStream: Send + Sync {
    /// Stream identifier on the connection.
    fn id(&self) -> u32;

    /// Submit a batch of ops in canonical order.
    fn start_batch(&self, ops: Vec<WireOp>, done: BatchDone);

    /// Abort the stream with `status`.
    fn cancel(&self, status: Status);
}

/// Client side of a connection: opens outbound streams.
pub trait Transport: Send + Sync {
    fn open_stream(
        &self,
        method: &str,
        deadline: Deadline,
    ) -> Result<Arc<dyn TransportStream>, TransportError>;
}
