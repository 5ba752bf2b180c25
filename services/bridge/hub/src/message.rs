//! Message contract shared by both ends of the bridge.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::any::Any;
use std::sync::Arc;

/// A message that can be published on the hub and carried over the wire
pub trait Message: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Stable cross-process identifier of the message contract
    ///
    /// Both peers must resolve the same type from the same id, so include a
    /// namespace and a version (`redb.bridge.Heartbeat/v1`).
    const TYPE_ID: &'static str;
}

/// A message whose concrete type is only known to its route
pub type ErasedMessage = Arc<dyn Any + Send + Sync>;
