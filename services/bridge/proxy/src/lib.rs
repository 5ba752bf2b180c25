//! Remote pub/sub proxy for the bridge.
//!
//! A [`RemotePubSubProxy`] mirrors a process-local [`MessageHub`] onto a peer
//! reachable over a local pipe. Local subscriptions are tracked per message
//! type and announced to the peer on the first subscriber and withdrawn on
//! the last; messages the peer forwards are republished on the local hub.
//! The proxy survives transport drops with a single-flight reconnection loop
//! and replays every active subscription after each reconnect.
//!
//! The [`PubSubServer`] is the peer side: it accepts proxies, forwards the
//! types they subscribed to, and publishes what they send on its own hub.
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge_hub::{handler_fn, MessageHub};
//! use bridge_proxy::{ConnectOptions, DisconnectedFromServerEvent, RemotePubSubProxy};
//! use bridge_session::PipeAddress;
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let proxy = RemotePubSubProxy::local(Arc::new(MessageHub::new()));
//!
//! // Lifecycle events are published on the local hub
//! proxy.hub().subscribe(handler_fn(|event: Arc<DisconnectedFromServerEvent>| async move {
//!     println!("disconnected, lost connection: {}", event.lost_connection);
//!     Ok(())
//! }));
//!
//! let connected = proxy
//!     .connect(PipeAddress::local("redb-bridge"), ConnectOptions::default())
//!     .await?;
//! println!("connected immediately: {}", connected);
//!
//! proxy.disconnect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! [`MessageHub`]: bridge_hub::MessageHub

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod correlator;
pub mod error;
pub mod events;
pub mod proxy;
pub mod registry;
pub mod scope;
pub mod server;
pub mod state;

#[cfg(test)]
mod test_support;

// Re-export main types
pub use correlator::{process, when, Bus};
pub use error::{CorrelationError, ProxyError};
pub use events::{ConnectedToServerEvent, DisconnectedFromServerEvent, RemoteClientConnectedEvent};
pub use proxy::RemotePubSubProxy;
pub use registry::{ControlSink, SubscriptionRegistry};
pub use scope::{ConnectOptions, ConnectionScope};
pub use server::{PubSubServer, ServerConfig};
pub use state::ConnectionState;
