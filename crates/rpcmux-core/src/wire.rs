//! Transport-facing op codes and payloads.
//!
//! These are the *lingua franca* between the batch engine and a transport.
//! Send ops carry their data by value. Receive ops carry a `RecvCell` that
//! the transport fills before completing the batch; the batch finisher then
//! moves the value to the caller's destination.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;

use crate::metadata::MetadataMap;
use crate::status::StatusCode;

/// Wire op kinds. Discriminants are stable and transport visible.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum OpCode {
    SendInitialMetadata = 0,
    SendMessage = 1,
    SendCloseFromClient = 2,
    SendStatusFromServer = 3,
    RecvInitialMetadata = 4,
    RecvMessage = 5,
    RecvStatusOnClient = 6,
    RecvCloseOnServer = 7,
}

impl OpCode {
    pub fn name(self) -> &'static str {
        match self {
            Self::SendInitialMetadata => "SEND_INITIAL_METADATA",
            Self::SendMessage => "SEND_MESSAGE",
            Self::SendCloseFromClient => "SEND_CLOSE_FROM_CLIENT",
            Self::SendStatusFromServer => "SEND_STATUS_FROM_SERVER",
            Self::RecvInitialMetadata => "RECV_INITIAL_METADATA",
            Self::RecvMessage => "RECV_MESSAGE",
            Self::RecvStatusOnClient => "RECV_STATUS_ON_CLIENT",
            Self::RecvCloseOnServer => "RECV_CLOSE_ON_SERVER",
        }
    }

    /// Send-direction op (the rest are receive-direction).
    #[inline]
    pub fn is_send(self) -> bool {
        (self as u8) <= Self::SendStatusFromServer as u8
    }

    /// Only meaningful on a client call.
    #[inline]
    pub fn client_only(self) -> bool {
        matches!(
            self,
            Self::SendCloseFromClient | Self::RecvInitialMetadata | Self::RecvStatusOnClient
        )
    }

    /// Only meaningful on a server call.
    #[inline]
    pub fn server_only(self) -> bool {
        matches!(self, Self::SendStatusFromServer | Self::RecvCloseOnServer)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Per-message write flags.
pub mod write_flags {
    /// The write may be held back and coalesced with later writes.
    pub const BUFFER_HINT: u32 = 1 << 0;
    /// Do not compress this message.
    pub const NO_COMPRESS: u32 = 1 << 1;
    /// Flush to the wire before completing the op.
    pub const WRITE_THROUGH: u32 = 1 << 2;
    /// Every flag a SEND_MESSAGE op may carry.
    pub const KNOWN_MASK: u32 = BUFFER_HINT | NO_COMPRESS | WRITE_THROUGH;
}

/// Options for one message write. Flags are per message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOptions {
    flags: u32,
    last_message: bool,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw flags. Unknown bits are rejected when the batch is submitted.
    pub fn with_flags(mut self, flags: u32) -> Self {
        self.flags = flags;
        self
    }

    pub fn set_buffer_hint(mut self) -> Self {
        self.flags |= write_flags::BUFFER_HINT;
        self
    }

    pub fn set_no_compression(mut self) -> Self {
        self.flags |= write_flags::NO_COMPRESS;
        self
    }

    pub fn set_write_through(mut self) -> Self {
        self.flags |= write_flags::WRITE_THROUGH;
        self
    }

    /// This is the last message of the stream: the half-close rides in the
    /// same batch as the write.
    pub fn set_last_message(mut self) -> Self {
        self.last_message = true;
        self
    }

    #[inline]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    #[inline]
    pub fn is_last_message(&self) -> bool {
        self.last_message
    }

    #[inline]
    pub fn get_buffer_hint(&self) -> bool {
        self.flags & write_flags::BUFFER_HINT != 0
    }

    #[inline]
    pub fn get_no_compression(&self) -> bool {
        self.flags & write_flags::NO_COMPRESS != 0
    }
}

/// Slot a transport writes a received value into.
///
/// Shared between the op in flight and the batch finisher that consumes it.
#[derive(Debug)]
pub struct RecvCell<T> {
    inner: Arc<Mutex<Option<T>>>,
}

impl<T> RecvCell<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(None)),
        }
    }

    /// Store `value`, replacing any earlier one.
    pub fn fill(&self, value: T) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = Some(value);
    }

    pub fn take(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    pub fn is_filled(&self) -> bool {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).is_some()
    }
}

impl<T: Clone> RecvCell<T> {
    /// Copy of the value, leaving it in place.
    pub fn cloned(&self) -> Option<T> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<T> Clone for RecvCell<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for RecvCell<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Status as it arrives in trailers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireStatus {
    pub code: StatusCode,
    pub details: String,
    pub trailing_metadata: MetadataMap,
    /// Transport-side diagnostic, set only for non-OK statuses.
    pub error_string: Option<String>,
}

impl WireStatus {
    pub fn new(code: StatusCode, details: impl Into<String>) -> Self {
        Self {
            code,
            details: details.into(),
            trailing_metadata: MetadataMap::new(),
            error_string: None,
        }
    }
}

/// Per-kind op payload.
#[derive(Debug)]
pub enum OpData {
    SendInitialMetadata { metadata: MetadataMap },
    SendMessage { payload: Bytes },
    SendCloseFromClient,
    SendStatusFromServer { status: WireStatus },
    RecvInitialMetadata { metadata: RecvCell<MetadataMap> },
    RecvMessage { message: RecvCell<Bytes> },
    RecvStatusOnClient { status: RecvCell<WireStatus> },
    /// Filled with `true` if the call was cancelled before status went out.
    RecvCloseOnServer { cancelled: RecvCell<bool> },
}

/// One op of a batch.
#[derive(Debug)]
pub struct WireOp {
    pub flags: u32,
    pub data: OpData,
}

impl WireOp {
    pub fn new(data: OpData) -> Self {
        Self { flags: 0, data }
    }

    pub fn with_flags(data: OpData, flags: u32) -> Self {
        Self { flags, data }
    }

    pub fn code(&self) -> OpCode {
        match self.data {
            OpData::SendInitialMetadata { .. } => OpCode::SendInitialMetadata,
            OpData::SendMessage { .. } => OpCode::SendMessage,
            OpData::SendCloseFromClient => OpCode::SendCloseFromClient,
            OpData::SendStatusFromServer { .. } => OpCode::SendStatusFromServer,
            OpData::RecvInitialMetadata { .. } => OpCode::RecvInitialMetadata,
            OpData::RecvMessage { .. } => OpCode::RecvMessage,
            OpData::RecvStatusOnClient { .. } => OpCode::RecvStatusOnClient,
            OpData::RecvCloseOnServer { .. } => OpCode::RecvCloseOnServer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_split() {
        assert!(OpCode::SendStatusFromServer.is_send());
        assert!(!OpCode::RecvInitialMetadata.is_send());
        assert!(OpCode::RecvStatusOnClient.client_only());
        assert!(OpCode::RecvCloseOnServer.server_only());
        assert!(!OpCode::SendMessage.client_only() && !OpCode::SendMessage.server_only());
    }

    #[test]
    fn test_recv_cell_shared() {
        let cell = RecvCell::new();
        let transport_side = cell.clone();
        assert!(!cell.is_filled());
        transport_side.fill(Bytes::from_static(b"hi"));
        assert!(cell.is_filled());
        assert_eq!(cell.take(), Some(Bytes::from_static(b"hi")));
        assert!(cell.take().is_none());
    }

    #[test]
    fn test_write_options() {
        let opts = WriteOptions::new().set_no_compression().set_last_message();
        assert!(opts.get_no_compression());
        assert!(!opts.get_buffer_hint());
        assert!(opts.is_last_message());
        assert_eq!(opts.flags() & !write_flags::KNOWN_MASK, 0);
    }
}
