//! Message serialization.
//!
//! Send slots serialize when the slot is set; receive slots deserialize in
//! their finisher. Real stubs plug a protobuf codec in here; the impls below
//! cover raw bytes and UTF-8 text.

use bytes::{Bytes, BytesMut};

use crate::error::CodecError;

/// A type that can travel as a message payload.
pub trait Message: Sized + Send + 'static {
    /// Serialize into `buf`.
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError>;

    /// Deserialize a complete payload.
    fn decode(buf: Bytes) -> Result<Self, CodecError>;

    /// Serialize into a fresh buffer.
    fn encode_to_bytes(&self) -> Result<Bytes, CodecError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

impl Message for Bytes {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<Self, CodecError> {
        Ok(buf)
    }

    fn encode_to_bytes(&self) -> Result<Bytes, CodecError> {
        Ok(self.clone())
    }
}

impl Message for Vec<u8> {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.extend_from_slice(self);
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<Self, CodecError> {
        Ok(buf.to_vec())
    }
}

impl Message for String {
    fn encode(&self, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.extend_from_slice(self.as_bytes());
        Ok(())
    }

    fn decode(buf: Bytes) -> Result<Self, CodecError> {
        String::from_utf8(buf.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
