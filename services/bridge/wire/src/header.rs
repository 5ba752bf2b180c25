//! Fixed frame header for the wire protocol.
//!
//! Every frame starts with a 4-byte header (after the length prefix) that
//! carries the protocol version, the frame kind and the length of the
//! message type id that follows.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Wire protocol version
pub const WIRE_VERSION: u8 = 1;

/// Fixed header size in bytes
pub const FRAME_HEADER_SIZE: usize = 4;

/// Frame kinds as defined in the wire protocol
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameKind {
    /// Peer should start forwarding messages of the type
    Subscribe = 0x01,
    /// Peer should stop forwarding messages of the type
    Unsubscribe = 0x02,
    /// A published message
    Message = 0x03,
}

impl FrameKind {
    /// Whether this kind belongs to the control plane
    pub fn is_control(self) -> bool {
        matches!(self, FrameKind::Subscribe | FrameKind::Unsubscribe)
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = crate::WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(FrameKind::Subscribe),
            0x02 => Ok(FrameKind::Unsubscribe),
            0x03 => Ok(FrameKind::Message),
            _ => Err(crate::WireError::Kind(value)),
        }
    }
}

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol version
    pub version: u8,
    /// Frame kind
    pub kind: FrameKind,
    /// Length of the type id in bytes
    pub type_id_len: u16,
}

impl FrameHeader {
    /// Create a header for the current protocol version
    pub fn new(kind: FrameKind, type_id_len: u16) -> Self {
        Self {
            version: WIRE_VERSION,
            kind,
            type_id_len,
        }
    }

    /// Encode header to buffer
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.kind as u8);
        buf.put_u16(self.type_id_len);
    }

    /// Decode header from buffer
    pub fn decode(buf: &mut Bytes) -> Result<Self, crate::WireError> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Err(crate::WireError::Malformed);
        }

        let version = buf.get_u8();
        if version != WIRE_VERSION {
            return Err(crate::WireError::Version(version));
        }

        let kind = FrameKind::try_from(buf.get_u8())?;
        let type_id_len = buf.get_u16();

        Ok(Self {
            version,
            kind,
            type_id_len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireError;

    #[test]
    fn test_header_encode_decode() {
        let header = FrameHeader::new(FrameKind::Message, 42);

        let mut buf = BytesMut::new();
        header.encode(&mut buf);
        assert_eq!(buf.len(), FRAME_HEADER_SIZE);

        let mut bytes = buf.freeze();
        let decoded = FrameHeader::decode(&mut bytes).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_header_rejects_unknown_version() {
        let mut bytes = Bytes::from_static(&[9, 0x01, 0, 1]);
        assert_eq!(FrameHeader::decode(&mut bytes), Err(WireError::Version(9)));
    }

    #[test]
    fn test_frame_kind_conversion() {
        assert_eq!(FrameKind::try_from(0x01), Ok(FrameKind::Subscribe));
        assert_eq!(FrameKind::try_from(0x02), Ok(FrameKind::Unsubscribe));
        assert_eq!(FrameKind::try_from(0x03), Ok(FrameKind::Message));
        assert_eq!(FrameKind::try_from(0x7F), Err(WireError::Kind(0x7F)));

        assert!(FrameKind::Subscribe.is_control());
        assert!(!FrameKind::Message.is_control());
    }
}
