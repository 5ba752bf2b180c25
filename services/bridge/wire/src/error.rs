//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Unsupported protocol version
    #[error("version unsupported: {0}")]
    Version(u8),

    /// Size limit exceeded
    #[error("size limit exceeded: {0}")]
    Size(usize),

    /// Unknown frame kind
    #[error("unknown kind {0}")]
    Kind(u8),

    /// Message type id is empty
    #[error("empty type id")]
    EmptyTypeId,

    /// Message type id exceeds the allowed length
    #[error("type id too long: {0} bytes")]
    TypeIdTooLong(usize),

    /// Message type id is not valid UTF-8
    #[error("type id is not valid utf-8")]
    Utf8,

    /// Malformed frame structure
    #[error("malformed frame")]
    Malformed,
}
