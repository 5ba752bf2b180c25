//! Message types exchanged by `serve` and `connect`.

use bridge_hub::Message;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Published by the server at a fixed interval
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sequence: u64,
    pub sent_at: DateTime<Utc>,
}

impl Message for Heartbeat {
    const TYPE_ID: &'static str = "redb.bridge.demo.Heartbeat/v1";
}

/// Sent by a client; the server answers with an [`EchoReply`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoRequest {
    pub id: u64,
    pub text: String,
}

impl Message for EchoRequest {
    const TYPE_ID: &'static str = "redb.bridge.demo.EchoRequest/v1";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EchoReply {
    pub id: u64,
    pub text: String,
    pub served_at: DateTime<Utc>,
}

impl Message for EchoReply {
    const TYPE_ID: &'static str = "redb.bridge.demo.EchoReply/v1";
}

impl EchoReply {
    pub fn answer(request: &EchoRequest) -> Self {
        Self {
            id: request.id,
            text: request.text.clone(),
            served_at: Utc::now(),
        }
    }
}
