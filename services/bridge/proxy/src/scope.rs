//! Connection scope and connect options.

use bridge_session::PipeAddress;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options for [`RemotePubSubProxy::connect`](crate::RemotePubSubProxy::connect)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Delay between reconnect attempts; zero disables reconnection
    pub reconnect_period: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            reconnect_period: Duration::from_secs(5),
        }
    }
}

impl ConnectOptions {
    /// Set the connect timeout
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the reconnect period
    pub fn with_reconnect_period(mut self, period: Duration) -> Self {
        self.reconnect_period = period;
        self
    }

    /// Disable reconnection; connect failures are surfaced
    pub fn without_reconnect(self) -> Self {
        self.with_reconnect_period(Duration::ZERO)
    }
}

/// One logical connection: from `connect()` until `disconnect()`
///
/// A scope outlives reconnects. Cancelling it aborts the pending connect
/// attempt and the reconnection loop.
#[derive(Debug)]
pub struct ConnectionScope {
    /// Server address
    pub address: PipeAddress,
    /// Options the scope was created with
    pub options: ConnectOptions,
    cancel: CancellationToken,
}

impl ConnectionScope {
    /// Create a scope for one logical connection
    pub fn new(address: PipeAddress, options: ConnectOptions) -> Self {
        Self {
            address,
            options,
            cancel: CancellationToken::new(),
        }
    }

    /// Bound on a single connect attempt
    pub fn connect_timeout(&self) -> Duration {
        self.options.connect_timeout
    }

    /// Delay between reconnect attempts
    pub fn reconnect_period(&self) -> Duration {
        self.options.reconnect_period
    }

    /// Whether dropped or failed connections are retried
    pub fn reconnects(&self) -> bool {
        !self.options.reconnect_period.is_zero()
    }

    /// Token cancelled when the scope ends
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// End the scope
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the scope has ended
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
