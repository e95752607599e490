//! Batch builder
//!
//! An `OpSet` is a fixed set of optional slots, one per op kind. Setters
//! activate slots; `fill_ops` turns the active slots into wire ops in
//! canonical order; `finalize_result` runs every active slot's finisher once
//! the transport has completed the batch.
//!
//! Canonical order:
//!
//! ```text
//! SEND_INITIAL_METADATA, SEND_MESSAGE, SEND_CLOSE_FROM_CLIENT |
//! SEND_STATUS_FROM_SERVER, RECV_INITIAL_METADATA, RECV_MESSAGE,
//! RECV_STATUS_ON_CLIENT | RECV_CLOSE_ON_SERVER
//! ```
//!
//! Received values land in `Received<T>` destinations. The caller keeps a
//! clone and reads it after the batch's tag has been observed.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::codec::Message;
use crate::completion_queue::CompletionHandler;
use crate::error::{CallError, CodecError};
use crate::metadata::MetadataMap;
use crate::status::{Status, StatusCode, ERROR_DETAILS_KEY};
use crate::transport::Side;
use crate::wire::{write_flags, OpCode, OpData, RecvCell, WireOp, WireStatus, WriteOptions};

/// Caller-owned destination of a received value.
///
/// Clones share the same slot.
pub struct Received<T>(RecvCell<T>);

impl<T> Received<T> {
    pub fn new() -> Self {
        Self(RecvCell::new())
    }

    pub fn set(&self, value: T) {
        self.0.fill(value);
    }

    /// Move the value out.
    pub fn take(&self) -> Option<T> {
        self.0.take()
    }

    pub fn is_set(&self) -> bool {
        self.0.is_filled()
    }
}

impl<T: Clone> Received<T> {
    /// Copy of the value, leaving it in place.
    pub fn get(&self) -> Option<T> {
        self.0.cloned()
    }
}

impl<T> Clone for Received<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> Default for Received<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Received<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Received").field("set", &self.is_set()).finish()
    }
}

// ============================================================================
// Slots
// ============================================================================

struct SendInitialMetadataSlot {
    metadata: MetadataMap,
    flags: u32,
}

struct SendMessageSlot {
    /// Serialized payload; released by the finisher.
    payload: Bytes,
    options: WriteOptions,
}

struct RecvInitialMetadataSlot {
    scratch: RecvCell<MetadataMap>,
    dest: Received<MetadataMap>,
}

type DecodeFn = Box<dyn FnOnce(Bytes) -> Result<(), CodecError> + Send>;

struct RecvMessageSlot {
    scratch: RecvCell<Bytes>,
    /// Deserializes into the caller's `Received<R>`.
    decode: DecodeFn,
}

struct ClientRecvStatusSlot {
    scratch: RecvCell<WireStatus>,
    status: Received<Status>,
    trailing: Received<MetadataMap>,
    debug_error: Received<String>,
}

struct RecvCloseSlot {
    scratch: RecvCell<bool>,
    dest: Received<bool>,
}

/// One batch of ops against a single call.
#[derive(Default)]
pub struct OpSet {
    send_initial_metadata: Option<SendInitialMetadataSlot>,
    send_message: Option<SendMessageSlot>,
    client_send_close: bool,
    server_send_status: Option<WireStatus>,
    recv_initial_metadata: Option<RecvInitialMetadataSlot>,
    recv_message: Option<RecvMessageSlot>,
    allow_no_message: bool,
    client_recv_status: Option<ClientRecvStatusSlot>,
    recv_close: Option<RecvCloseSlot>,
    got_message: Arc<AtomicBool>,
    /// Completion is finalized but never surfaced.
    hidden: bool,
}

impl OpSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Batch whose completion is finalized but hidden from `next`/`pluck`.
    pub fn sneaky() -> Self {
        Self {
            hidden: true,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_sneaky(&self) -> bool {
        self.hidden
    }

    // ------------------------------------------------------------------------
    // Send slots
    // ------------------------------------------------------------------------

    pub fn send_initial_metadata(&mut self, metadata: MetadataMap, flags: u32) -> &mut Self {
        self.send_initial_metadata = Some(SendInitialMetadataSlot { metadata, flags });
        self
    }

    /// Serialize `msg` now; the bytes are held until the batch finishes.
    pub fn send_message<M: Message>(
        &mut self,
        msg: &M,
        options: WriteOptions,
    ) -> Result<&mut Self, CodecError> {
        let payload = msg.encode_to_bytes()?;
        self.send_message = Some(SendMessageSlot {
            payload,
            options,
        });
        Ok(self)
    }

    pub fn client_send_close(&mut self) -> &mut Self {
        self.client_send_close = true;
        self
    }

    pub fn server_send_status(&mut self, mut trailing: MetadataMap, status: &Status) -> &mut Self {
        if !status.details().is_empty() {
            trailing.insert(ERROR_DETAILS_KEY, status.details().clone());
        }
        self.server_send_status = Some(WireStatus {
            code: status.code(),
            details: status.message().to_owned(),
            trailing_metadata: trailing,
            error_string: None,
        });
        self
    }

    // ------------------------------------------------------------------------
    // Receive slots
    // ------------------------------------------------------------------------

    pub fn recv_initial_metadata(&mut self) -> Received<MetadataMap> {
        let dest = Received::new();
        self.recv_initial_metadata_into(dest.clone());
        dest
    }

    /// Receive initial metadata into an existing destination.
    pub fn recv_initial_metadata_into(&mut self, dest: Received<MetadataMap>) -> &mut Self {
        self.recv_initial_metadata = Some(RecvInitialMetadataSlot {
            scratch: RecvCell::new(),
            dest,
        });
        self
    }

    pub fn recv_message<R: Message>(&mut self) -> Received<R> {
        let dest = Received::new();
        let sink = dest.clone();
        self.recv_message = Some(RecvMessageSlot {
            scratch: RecvCell::new(),
            decode: Box::new(move |buf| {
                sink.set(R::decode(buf)?);
                Ok(())
            }),
        });
        dest
    }

    /// A missing message does not fail the batch.
    pub fn allow_no_message(&mut self) -> &mut Self {
        self.allow_no_message = true;
        self
    }

    pub fn client_recv_status(&mut self) -> Received<Status> {
        let status = Received::new();
        self.client_recv_status_into(status.clone(), Received::new(), Received::new());
        status
    }

    /// Receive the final status, trailing metadata and the transport's
    /// debug error string into existing destinations.
    pub fn client_recv_status_into(
        &mut self,
        status: Received<Status>,
        trailing: Received<MetadataMap>,
        debug_error: Received<String>,
    ) -> &mut Self {
        self.client_recv_status = Some(ClientRecvStatusSlot {
            scratch: RecvCell::new(),
            status,
            trailing,
            debug_error,
        });
        self
    }

    /// `true` lands in the destination if the call was cancelled.
    pub fn recv_close_on_server(&mut self) -> Received<bool> {
        let dest = Received::new();
        self.recv_close = Some(RecvCloseSlot {
            scratch: RecvCell::new(),
            dest: dest.clone(),
        });
        dest
    }

    // ------------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------------

    /// Active op kinds in canonical order.
    pub fn op_codes(&self) -> Vec<OpCode> {
        let mut codes = Vec::with_capacity(8);
        let slots = [
            (self.send_initial_metadata.is_some(), OpCode::SendInitialMetadata),
            (self.send_message.is_some(), OpCode::SendMessage),
            (self.client_send_close, OpCode::SendCloseFromClient),
            (self.server_send_status.is_some(), OpCode::SendStatusFromServer),
            (self.recv_initial_metadata.is_some(), OpCode::RecvInitialMetadata),
            (self.recv_message.is_some(), OpCode::RecvMessage),
            (self.client_recv_status.is_some(), OpCode::RecvStatusOnClient),
            (self.recv_close.is_some(), OpCode::RecvCloseOnServer),
        ];
        for (active, code) in slots {
            if active {
                codes.push(code);
            }
        }
        codes
    }

    pub fn is_empty(&self) -> bool {
        self.op_codes().is_empty()
    }

    pub fn has_send_ops(&self) -> bool {
        self.op_codes().iter().any(|c| c.is_send())
    }

    pub fn has_recv_ops(&self) -> bool {
        self.op_codes().iter().any(|c| !c.is_send())
    }

    /// Reject batches that cannot be submitted on a `side` call.
    pub fn check(&self, side: Side) -> Result<(), CallError> {
        let codes = self.op_codes();
        if codes.is_empty() {
            return Err(CallError::EmptyBatch);
        }
        for code in codes {
            let wrong = match side {
                Side::Client => code.server_only(),
                Side::Server => code.client_only(),
            };
            if wrong {
                return Err(CallError::WrongSide {
                    op: code.name(),
                    side,
                });
            }
        }
        if let Some(slot) = &self.send_message {
            let flags = slot.options.flags();
            if flags & !write_flags::KNOWN_MASK != 0 {
                return Err(CallError::InvalidFlags(flags));
            }
        }
        Ok(())
    }

    /// Wire ops for the active slots, in canonical order.
    pub fn fill_ops(&mut self) -> Vec<WireOp> {
        let mut ops = Vec::with_capacity(8);

        if let Some(slot) = &mut self.send_initial_metadata {
            let metadata = std::mem::take(&mut slot.metadata);
            ops.push(WireOp::with_flags(OpData::SendInitialMetadata { metadata }, slot.flags));
        }
        if let Some(slot) = &self.send_message {
            ops.push(WireOp::with_flags(
                OpData::SendMessage {
                    payload: slot.payload.clone(),
                },
                slot.options.flags(),
            ));
        }
        if self.client_send_close {
            ops.push(WireOp::new(OpData::SendCloseFromClient));
        }
        if let Some(status) = self.server_send_status.take() {
            ops.push(WireOp::new(OpData::SendStatusFromServer { status }));
        }
        if let Some(slot) = &self.recv_initial_metadata {
            ops.push(WireOp::new(OpData::RecvInitialMetadata {
                metadata: slot.scratch.clone(),
            }));
        }
        if let Some(slot) = &self.recv_message {
            ops.push(WireOp::new(OpData::RecvMessage {
                message: slot.scratch.clone(),
            }));
        }
        if let Some(slot) = &self.client_recv_status {
            ops.push(WireOp::new(OpData::RecvStatusOnClient {
                status: slot.scratch.clone(),
            }));
        }
        if let Some(slot) = &self.recv_close {
            ops.push(WireOp::new(OpData::RecvCloseOnServer {
                cancelled: slot.scratch.clone(),
            }));
        }
        ops
    }

    // ------------------------------------------------------------------------
    // Completion
    // ------------------------------------------------------------------------

    /// Run every active slot's finisher; returns the aggregate outcome.
    ///
    /// Slots are consumed, so a second call only reports `ok`.
    pub fn finalize_result(&mut self, ok: bool) -> bool {
        let mut status = ok;

        // Send slots only release what they hold.
        self.send_initial_metadata = None;
        self.send_message = None;
        self.client_send_close = false;
        self.server_send_status = None;

        if let Some(slot) = self.recv_initial_metadata.take() {
            slot.dest.set(slot.scratch.take().unwrap_or_default());
        }

        if let Some(slot) = self.recv_message.take() {
            let got = match slot.scratch.take() {
                Some(buf) if ok => match (slot.decode)(buf) {
                    Ok(()) => true,
                    Err(e) => {
                        log::debug!("received message failed to decode: {e}");
                        status = false;
                        false
                    }
                },
                // Transport failed; the bytes are discarded undecoded.
                Some(_) => false,
                None => {
                    if !self.allow_no_message {
                        status = false;
                    }
                    false
                }
            };
            self.got_message.store(got, Ordering::Release);
        }

        if let Some(slot) = self.client_recv_status.take() {
            let wire = slot.scratch.take().unwrap_or_else(|| {
                WireStatus::new(StatusCode::Unknown, "call completed without a status")
            });
            let details = wire
                .trailing_metadata
                .get(ERROR_DETAILS_KEY)
                .cloned()
                .unwrap_or_default();
            slot.status
                .set(Status::new(wire.code, wire.details).with_details(details));
            if wire.code != StatusCode::Ok {
                if let Some(debug) = wire.error_string {
                    slot.debug_error.set(debug);
                }
            }
            slot.trailing.set(wire.trailing_metadata);
        }

        if let Some(slot) = self.recv_close.take() {
            // No report from the transport counts as cancelled.
            slot.dest.set(slot.scratch.take().unwrap_or(true));
        }

        status
    }

    /// Whether the RECV_MESSAGE slot decoded a message.
    pub fn got_message(&self) -> bool {
        self.got_message.load(Ordering::Acquire)
    }

    /// Whether the send slot still holds its serialized payload.
    pub fn holds_send_buffer(&self) -> bool {
        self.send_message.is_some()
    }
}

impl CompletionHandler for OpSet {
    fn finalize(mut self: Box<Self>, ok: bool) -> Option<bool> {
        let result = self.finalize_result(ok);
        if self.hidden {
            None
        } else {
            Some(result)
        }
    }
}

impl fmt::Debug for OpSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpSet")
            .field("ops", &self.op_codes())
            .field("allow_no_message", &self.allow_no_message)
            .field("sneaky", &self.hidden)
            .finish()
    }
}
