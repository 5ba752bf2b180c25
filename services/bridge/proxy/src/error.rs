//! Proxy error types.

use bridge_session::SessionError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the proxy and the server
#[derive(Error, Debug)]
pub enum ProxyError {
    /// `connect` was called while a connection exists or is being established
    #[error("already connected or connecting; call disconnect() before connecting again")]
    AlreadyConnected,

    /// No connection exists
    #[error("not connected")]
    NotConnected,

    /// The transport refused or failed the connection
    #[error("connect to {address} failed: {source}")]
    Connect {
        /// Address that was dialed
        address: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A connect attempt did not finish in time
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The operation was cancelled by `disconnect`
    #[error("cancelled")]
    Cancelled,

    /// Other transport failure
    #[error("session error: {0}")]
    Session(#[source] SessionError),

    /// A frame could not be built
    #[error("wire error: {0}")]
    Wire(#[from] bridge_wire::WireError),

    /// A payload could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] bridge_wire::CodecError),

    /// No codec is known for an inbound message
    #[error("unknown message type: {0}")]
    UnknownMessageType(String),
}

impl From<SessionError> for ProxyError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::Connect { address, source } => ProxyError::Connect { address, source },
            SessionError::Timeout(timeout) => ProxyError::Timeout(timeout),
            SessionError::Cancelled => ProxyError::Cancelled,
            SessionError::Closed => ProxyError::NotConnected,
            SessionError::Wire(e) => ProxyError::Wire(e),
            other => ProxyError::Session(other),
        }
    }
}

/// Errors surfaced by request/response calls
#[derive(Error, Debug)]
pub enum CorrelationError {
    /// No matching message arrived before the deadline
    #[error("no response within {0:?}")]
    Timeout(Duration),

    /// The caller's cancellation token fired first
    #[error("request cancelled")]
    Cancelled,

    /// The response subscription could not be registered
    #[error("subscribe failed: {0}")]
    Subscribe(#[source] ProxyError),

    /// The request could not be published
    #[error("publish failed: {0}")]
    Publish(#[source] ProxyError),
}
