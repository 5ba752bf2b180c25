//! Session error types.

use std::time::Duration;
use thiserror::Error;

/// Errors raised while opening or using a session
#[derive(Error, Debug)]
pub enum SessionError {
    /// The transport refused or failed the connection
    #[error("connect to {address} failed: {source}")]
    Connect {
        /// Address that was dialed
        address: String,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// The connect attempt did not finish in time
    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    /// The connect attempt was cancelled
    #[error("connect cancelled")]
    Cancelled,

    /// The session is closed
    #[error("session closed")]
    Closed,

    /// Frame could not be encoded
    #[error("wire error: {0}")]
    Wire(#[from] bridge_wire::WireError),

    /// I/O error on an established stream
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
