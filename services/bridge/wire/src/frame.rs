//! Message framing for the wire protocol.
//!
//! This module provides the complete frame structure: the fixed header,
//! the message type id and the (possibly empty) payload.

use crate::header::{FrameHeader, FrameKind, FRAME_HEADER_SIZE};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Maximum frame size (16 MiB default, 64 MiB hard limit)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;
/// Hard maximum frame size limit (64 MiB)
pub const HARD_MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// Maximum type id length (1 KiB)
pub const MAX_TYPE_ID_LEN: usize = 1024;

/// Check that a message type id can be carried in a frame
pub fn validate_type_id(type_id: &str) -> Result<(), crate::WireError> {
    if type_id.is_empty() {
        return Err(crate::WireError::EmptyTypeId);
    }
    if type_id.len() > MAX_TYPE_ID_LEN {
        return Err(crate::WireError::TypeIdTooLong(type_id.len()));
    }
    Ok(())
}

/// Complete wire frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind
    pub kind: FrameKind,
    /// Message type id the frame refers to
    pub type_id: String,
    /// Encoded message, empty for control frames
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame
    pub fn new(kind: FrameKind, type_id: impl Into<String>, payload: Bytes) -> Self {
        Self {
            kind,
            type_id: type_id.into(),
            payload,
        }
    }

    /// Subscribe control frame
    pub fn subscribe(type_id: impl Into<String>) -> Self {
        Self::new(FrameKind::Subscribe, type_id, Bytes::new())
    }

    /// Unsubscribe control frame
    pub fn unsubscribe(type_id: impl Into<String>) -> Self {
        Self::new(FrameKind::Unsubscribe, type_id, Bytes::new())
    }

    /// Published message frame
    pub fn message(type_id: impl Into<String>, payload: Bytes) -> Self {
        Self::new(FrameKind::Message, type_id, payload)
    }

    /// Get the total frame size when encoded
    pub fn encoded_size(&self) -> usize {
        4 + FRAME_HEADER_SIZE + self.type_id.len() + self.payload.len()
    }

    /// Check the structural rules shared by encoding and decoding
    fn validate(&self) -> Result<(), crate::WireError> {
        validate_type_id(&self.type_id)?;
        if self.kind.is_control() && !self.payload.is_empty() {
            return Err(crate::WireError::Malformed);
        }
        Ok(())
    }

    /// Encode frame to a contiguous buffer
    pub fn encode(&self, max_frame_size: usize) -> Result<Bytes, crate::WireError> {
        self.validate()?;

        let total_size = self.encoded_size();
        if total_size > max_frame_size.min(HARD_MAX_FRAME_SIZE) {
            return Err(crate::WireError::Size(total_size));
        }

        let mut buf = BytesMut::with_capacity(total_size);

        // Frame length (everything after this u32)
        let frame_len = total_size - 4;
        buf.put_u32(frame_len as u32);

        FrameHeader::new(self.kind, self.type_id.len() as u16).encode(&mut buf);
        buf.put_slice(self.type_id.as_bytes());
        buf.put_slice(&self.payload);

        Ok(buf.freeze())
    }
}

/// Frame decoder for parsing incoming frames
#[derive(Debug)]
pub struct FrameDecoder {
    max_frame_size: usize,
}

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Create a decoder with a custom frame size limit
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(HARD_MAX_FRAME_SIZE),
        }
    }

    /// Decode one frame from a buffer
    ///
    /// Returns `Ok(None)` while the buffer does not yet hold a complete frame.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Frame>, crate::WireError> {
        // Need at least 4 bytes for frame length
        if buf.len() < 4 {
            return Ok(None);
        }

        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

        if frame_len > self.max_frame_size {
            tracing::warn!(frame_len, limit = self.max_frame_size, "Rejecting oversized frame");
            return Err(crate::WireError::Size(frame_len));
        }

        if buf.len() < 4 + frame_len {
            return Ok(None);
        }

        buf.advance(4);
        let mut frame_buf = buf.split_to(frame_len).freeze();
        let header = FrameHeader::decode(&mut frame_buf)?;

        let type_id_len = header.type_id_len as usize;
        if frame_buf.len() < type_id_len {
            return Err(crate::WireError::Malformed);
        }
        let type_id_raw = frame_buf.split_to(type_id_len);
        let type_id = std::str::from_utf8(&type_id_raw)
            .map_err(|_| crate::WireError::Utf8)?
            .to_string();

        // Remaining bytes are payload
        let frame = Frame {
            kind: header.kind,
            type_id,
            payload: frame_buf,
        };
        frame.validate()?;

        Ok(Some(frame))
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}
