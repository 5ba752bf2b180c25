//! Wire protocol framing, control messages and payload encoding for the bridge.
//!
//! This crate provides the low-level wire protocol spoken between a
//! [`RemotePubSubProxy`] and its peer over a local pipe: length-prefixed
//! frames, the subscribe/unsubscribe control plane, and CBOR payloads for
//! published messages.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | u32 frame_len        | length of bytes that follow|
//! +----------------------+----------------------------+
//! | u8 version           | WIRE_VERSION               |
//! +----------------------+----------------------------+
//! | u8 kind              | SUBSCRIBE/UNSUBSCRIBE/MSG  |
//! +----------------------+----------------------------+
//! | u16 type_id_len      | length of the type id      |
//! +----------------------+----------------------------+
//! | type_id              | UTF-8 message type id      |
//! +----------------------+----------------------------+
//! | payload              | CBOR message (MSG only)    |
//! +----------------------+----------------------------+
//! ```
//!
//! All integers are big-endian.
//!
//! [`RemotePubSubProxy`]: https://docs.rs/bridge-proxy

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod error;
pub mod frame;
pub mod header;

// Re-export main types
pub use codec::{decode_payload, encode_payload, CodecError, ControlMessage, ControlOp};
pub use error::WireError;
pub use frame::{
    validate_type_id, Frame, FrameDecoder, DEFAULT_MAX_FRAME_SIZE, HARD_MAX_FRAME_SIZE,
    MAX_TYPE_ID_LEN,
};
pub use header::{FrameHeader, FrameKind, FRAME_HEADER_SIZE, WIRE_VERSION};
