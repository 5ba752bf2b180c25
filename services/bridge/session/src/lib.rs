//! Local pipe transport, send/recv loops and disconnect notification for the bridge.
//!
//! This crate provides everything the bridge needs from a byte-stream
//! transport: addressing a named local pipe, opening it with a timeout and a
//! cancellation token, and running a session that turns the raw stream into
//! frame events and a single "disconnected" notification.
//!
//! ## Features
//!
//! - **Local pipes**: Unix domain sockets on Unix, named pipes on Windows
//! - **In-memory transport**: `tokio::io::duplex` backed connectors and listeners
//! - **Bounded connect**: timeout and cancellation on every connect attempt
//! - **Sessions**: read/write loop with stats and drop notification
//!
//! ## Example
//!
//! ```rust,no_run
//! use bridge_session::{open_stream, LocalConnector, PipeAddress, Session, SessionConfig, SessionEvent};
//! use bridge_wire::Frame;
//! use std::time::Duration;
//! use tokio::sync::mpsc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let address = PipeAddress::local("redb-bridge");
//! let cancel = CancellationToken::new();
//! let stream = open_stream(&LocalConnector::new(), &address, Duration::from_secs(5), &cancel).await?;
//!
//! let (tx, mut rx) = mpsc::unbounded_channel();
//! let session = Session::spawn(stream, SessionConfig::default(), tx);
//! session.send_frame(&Frame::subscribe("Heartbeat"))?;
//!
//! while let Some(event) = rx.recv().await {
//!     match event {
//!         SessionEvent::Frame(frame) => println!("Received {:?} for {}", frame.kind, frame.type_id),
//!         SessionEvent::Disconnected { reason } => {
//!             println!("Disconnected: {}", reason);
//!             break;
//!         }
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod session;
pub mod transport;

// Re-export main types
pub use error::SessionError;
pub use session::{Session, SessionConfig, SessionEvent, SessionHandle, SessionStats};
pub use transport::{
    open_stream, Connector, IoStream, Listener, LocalConnector, LocalListener, MemoryConnector,
    MemoryListener, MemoryNetwork, PipeAddress,
};
