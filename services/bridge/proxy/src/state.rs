//! Observable connection state.

use std::fmt;

/// Connection state of a proxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection scope exists
    Idle,
    /// The first connect attempt is in progress
    Connecting,
    /// A session is established
    Connected,
    /// The reconnection loop is running
    Reconnecting,
    /// The session dropped and reconnection is disabled
    ///
    /// The scope is kept until `disconnect()` is called.
    Lost,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Idle => "idle",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Lost => "lost",
        };
        f.write_str(name)
    }
}
