//! Encoding and decoding for the wire protocol.
//!
//! This module maps frames onto the subscription control plane and provides
//! CBOR helpers for message payloads.

use crate::frame::Frame;
use crate::header::FrameKind;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Subscription control operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ControlOp {
    /// Start forwarding messages of a type
    Subscribe,
    /// Stop forwarding messages of a type
    Unsubscribe,
}

impl ControlOp {
    fn kind(self) -> FrameKind {
        match self {
            ControlOp::Subscribe => FrameKind::Subscribe,
            ControlOp::Unsubscribe => FrameKind::Unsubscribe,
        }
    }
}

/// Control message sent to the peer when local interest in a type changes
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ControlMessage {
    /// Message type id
    pub type_id: String,
    /// Operation
    pub op: ControlOp,
}

impl ControlMessage {
    /// Subscribe control message
    pub fn subscribe(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            op: ControlOp::Subscribe,
        }
    }

    /// Unsubscribe control message
    pub fn unsubscribe(type_id: impl Into<String>) -> Self {
        Self {
            type_id: type_id.into(),
            op: ControlOp::Unsubscribe,
        }
    }

    /// Convert into a wire frame
    pub fn into_frame(self) -> Frame {
        Frame::new(self.op.kind(), self.type_id, Bytes::new())
    }
}

impl TryFrom<Frame> for ControlMessage {
    type Error = CodecError;

    fn try_from(frame: Frame) -> Result<Self, Self::Error> {
        let op = match frame.kind {
            FrameKind::Subscribe => ControlOp::Subscribe,
            FrameKind::Unsubscribe => ControlOp::Unsubscribe,
            FrameKind::Message => return Err(CodecError::NotControl),
        };
        Ok(Self {
            type_id: frame.type_id,
            op,
        })
    }
}

/// Encode a message as a CBOR payload
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Bytes, CodecError> {
    let mut buf = Vec::new();
    ciborium::into_writer(message, &mut buf)
        .map_err(|e| CodecError::PayloadEncode(e.to_string()))?;
    Ok(Bytes::from(buf))
}

/// Decode a message from a CBOR payload
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T, CodecError> {
    ciborium::from_reader(payload).map_err(|e| CodecError::PayloadDecode(e.to_string()))
}

/// Codec errors
#[derive(Error, Debug)]
pub enum CodecError {
    /// Wire protocol error
    #[error("wire error: {0}")]
    Wire(#[from] crate::WireError),
    /// Payload encoding error
    #[error("payload encoding failed: {0}")]
    PayloadEncode(String),
    /// Payload decoding error
    #[error("payload decoding failed: {0}")]
    PayloadDecode(String),
    /// Frame is not a control frame
    #[error("not a control frame")]
    NotControl,
}
