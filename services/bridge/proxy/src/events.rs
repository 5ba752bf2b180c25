//! Lifecycle events published on the local hub.

use bridge_hub::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published after a connection (or reconnection) to the server is ready
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedToServerEvent {
    /// When the connection was established
    pub timestamp: DateTime<Utc>,
}

impl ConnectedToServerEvent {
    /// Event stamped with the current time
    pub fn now() -> Self {
        Self {
            timestamp: Utc::now(),
        }
    }
}

impl Message for ConnectedToServerEvent {
    const TYPE_ID: &'static str = "redb.bridge.ConnectedToServerEvent/v1";
}

/// Published when the connection to the server ends
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisconnectedFromServerEvent {
    /// When the connection ended
    pub timestamp: DateTime<Utc>,
    /// `true` for an unsolicited drop, `false` for `disconnect()`
    pub lost_connection: bool,
}

impl DisconnectedFromServerEvent {
    /// Event for an explicit disconnect
    pub fn explicit() -> Self {
        Self {
            timestamp: Utc::now(),
            lost_connection: false,
        }
    }

    /// Event for a dropped connection
    pub fn lost() -> Self {
        Self {
            timestamp: Utc::now(),
            lost_connection: true,
        }
    }
}

impl Message for DisconnectedFromServerEvent {
    const TYPE_ID: &'static str = "redb.bridge.DisconnectedFromServerEvent/v1";
}

/// Published by the server whenever a client connects
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteClientConnectedEvent {
    /// When the client connected
    pub timestamp: DateTime<Utc>,
    /// Clients connected, including the new one
    pub total_clients_count: usize,
}

impl RemoteClientConnectedEvent {
    /// Event stamped with the current time
    pub fn new(total_clients_count: usize) -> Self {
        Self {
            timestamp: Utc::now(),
            total_clients_count,
        }
    }
}

impl Message for RemoteClientConnectedEvent {
    const TYPE_ID: &'static str = "redb.bridge.RemoteClientConnectedEvent/v1";
}
