//! Process-local message hub for the bridge.
//!
//! Messages are routed by a stable type id ([`Message::TYPE_ID`]) rather than
//! by an in-process type handle, so the same id can travel over the wire and
//! select the same route on the other side.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge_hub::{handler_fn, Message, MessageHub};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct Heartbeat {
//!     seq: u64,
//! }
//!
//! impl Message for Heartbeat {
//!     const TYPE_ID: &'static str = "redb.bridge.Heartbeat/v1";
//! }
//!
//! # async fn example() {
//! let hub = MessageHub::new();
//! hub.subscribe(handler_fn(|beat: std::sync::Arc<Heartbeat>| async move {
//!     println!("heartbeat {}", beat.seq);
//!     Ok(())
//! }));
//! let delivered = hub.publish(Heartbeat { seq: 1 }).await;
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod catalog;
pub mod error;
pub mod handler;
pub mod hub;
pub mod message;

// Re-export main types
pub use catalog::{MessageCatalog, MessageCodec};
pub use error::{HandlerError, HubError};
pub use handler::{handler_fn, Handler, HandlerFuture, HandlerId, MessageHandler, RawHandler};
pub use hub::MessageHub;
pub use message::{ErasedMessage, Message};
