//! Payload codecs for message types known at run time only by their id.

use bridge_wire::{decode_payload, encode_payload, CodecError};
use bytes::Bytes;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;

use crate::message::{ErasedMessage, Message};

/// Encodes and decodes one message type behind an erased interface
#[derive(Clone, Copy)]
pub struct MessageCodec {
    type_id: &'static str,
    encode: fn(&ErasedMessage) -> Result<Bytes, CodecError>,
    decode: fn(&[u8]) -> Result<ErasedMessage, CodecError>,
}

impl MessageCodec {
    /// Codec for message type `M`
    pub fn of<M: Message>() -> Self {
        Self {
            type_id: M::TYPE_ID,
            encode: encode_erased::<M>,
            decode: decode_erased::<M>,
        }
    }

    /// Type id handled by this codec
    pub fn type_id(&self) -> &'static str {
        self.type_id
    }

    /// Encode a message of this codec's type
    pub fn encode(&self, message: &ErasedMessage) -> Result<Bytes, CodecError> {
        (self.encode)(message)
    }

    /// Decode a payload into a message of this codec's type
    pub fn decode(&self, payload: &[u8]) -> Result<ErasedMessage, CodecError> {
        (self.decode)(payload)
    }
}

impl fmt::Debug for MessageCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageCodec")
            .field("type_id", &self.type_id)
            .finish()
    }
}

fn encode_erased<M: Message>(message: &ErasedMessage) -> Result<Bytes, CodecError> {
    let message = message.downcast_ref::<M>().ok_or_else(|| {
        CodecError::PayloadEncode(format!("message is not a {}", M::TYPE_ID))
    })?;
    encode_payload(message)
}

fn decode_erased<M: Message>(payload: &[u8]) -> Result<ErasedMessage, CodecError> {
    let message: M = decode_payload(payload)?;
    Ok(Arc::new(message))
}

/// Registry of codecs keyed by type id
#[derive(Debug, Default)]
pub struct MessageCatalog {
    codecs: DashMap<String, MessageCodec>,
}

impl MessageCatalog {
    /// Create an empty catalog
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the codec for `M`
    pub fn register<M: Message>(&self) -> &Self {
        self.insert(MessageCodec::of::<M>());
        self
    }

    /// Register a codec
    pub fn insert(&self, codec: MessageCodec) {
        self.codecs.insert(codec.type_id().to_string(), codec);
    }

    /// Codec for a type id
    pub fn get(&self, type_id: &str) -> Option<MessageCodec> {
        self.codecs.get(type_id).map(|codec| *codec)
    }

    /// Whether a codec is registered for a type id
    pub fn contains(&self, type_id: &str) -> bool {
        self.codecs.contains_key(type_id)
    }

    /// Number of registered codecs
    pub fn len(&self) -> usize {
        self.codecs.len()
    }

    /// Whether the catalog is empty
    pub fn is_empty(&self) -> bool {
        self.codecs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Price {
        symbol: String,
        cents: u64,
    }

    impl Message for Price {
        const TYPE_ID: &'static str = "test.Price";
    }

    #[test]
    fn test_catalog_codec_roundtrip() {
        let catalog = MessageCatalog::new();
        catalog.register::<Price>();
        assert!(catalog.contains(Price::TYPE_ID));
        assert_eq!(catalog.len(), 1);

        let codec = catalog.get(Price::TYPE_ID).unwrap();
        let message: ErasedMessage = Arc::new(Price {
            symbol: "ACME".into(),
            cents: 1250,
        });
        let payload = codec.encode(&message).unwrap();
        let decoded = codec.decode(&payload).unwrap();
        assert_eq!(
            decoded.downcast_ref::<Price>(),
            Some(&Price {
                symbol: "ACME".into(),
                cents: 1250
            })
        );
    }

    #[test]
    fn test_codec_rejects_foreign_message() {
        let codec = MessageCodec::of::<Price>();
        let message: ErasedMessage = Arc::new("not a price".to_string());
        assert!(matches!(
            codec.encode(&message),
            Err(CodecError::PayloadEncode(_))
        ));
    }

    #[test]
    fn test_unknown_type_has_no_codec() {
        let catalog = MessageCatalog::new();
        assert!(catalog.is_empty());
        assert!(catalog.get("test.Unknown").is_none());
    }
}
