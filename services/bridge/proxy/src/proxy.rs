//! The remote pub/sub proxy: connection lifecycle, reconnection and inbound dispatch.

use async_trait::async_trait;
use bridge_hub::{Handler, Message, MessageHub};
use bridge_session::{
    open_stream, Connector, IoStream, LocalConnector, PipeAddress, Session, SessionConfig,
    SessionEvent, SessionHandle,
};
use bridge_wire::{encode_payload, Frame, FrameKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::correlator::{self, Bus};
use crate::error::{CorrelationError, ProxyError};
use crate::events::{ConnectedToServerEvent, DisconnectedFromServerEvent};
use crate::registry::SubscriptionRegistry;
use crate::scope::{ConnectOptions, ConnectionScope};
use crate::state::ConnectionState;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// The live session of the current scope
struct SessionLink {
    handle: SessionHandle,
    // Cancelled to detach the drop notification before an intentional close
    detach: CancellationToken,
}

/// Clears the single-flight flag however the reconnection loop exits
struct ReconnectGuard<'a>(&'a AtomicBool);

impl Drop for ReconnectGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct Inner {
    hub: Arc<MessageHub>,
    connector: Arc<dyn Connector>,
    session_config: SessionConfig,
    registry: SubscriptionRegistry,
    // Lock order: link, then registry or scope
    scope: Mutex<Option<Arc<ConnectionScope>>>,
    link: Mutex<Option<SessionLink>>,
    reconnecting: Arc<AtomicBool>,
    state: watch::Sender<ConnectionState>,
}

/// Client-side proxy mirroring a local [`MessageHub`] onto a remote peer
///
/// Cloning the proxy yields another handle to the same connection.
#[derive(Clone)]
pub struct RemotePubSubProxy {
    inner: Arc<Inner>,
}

impl RemotePubSubProxy {
    /// Create a proxy that dials with `connector`
    pub fn new(hub: Arc<MessageHub>, connector: Arc<dyn Connector>) -> Self {
        Self::with_session_config(hub, connector, SessionConfig::default())
    }

    /// Create a proxy for local pipes
    pub fn local(hub: Arc<MessageHub>) -> Self {
        Self::new(hub, Arc::new(LocalConnector::new()))
    }

    /// Create a proxy with explicit session settings
    pub fn with_session_config(
        hub: Arc<MessageHub>,
        connector: Arc<dyn Connector>,
        session_config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        Self {
            inner: Arc::new(Inner {
                registry: SubscriptionRegistry::new(hub.clone()),
                hub,
                connector,
                session_config,
                scope: Mutex::new(None),
                link: Mutex::new(None),
                reconnecting: Arc::new(AtomicBool::new(false)),
                state,
            }),
        }
    }

    /// The local hub
    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.inner.hub
    }

    /// Connect to the server at `address`
    ///
    /// Returns `Ok(true)` once connected. If the first attempt fails and
    /// reconnection is enabled, the reconnection loop is started and
    /// `Ok(false)` is returned right away; with reconnection disabled the
    /// failure is returned and the proxy is idle again.
    pub async fn connect(
        &self,
        address: PipeAddress,
        options: ConnectOptions,
    ) -> Result<bool, ProxyError> {
        let scope = {
            let mut current = lock(&self.inner.scope);
            if current.is_some() {
                return Err(ProxyError::AlreadyConnected);
            }
            let scope = Arc::new(ConnectionScope::new(address, options));
            *current = Some(scope.clone());
            self.inner.state.send_replace(ConnectionState::Connecting);
            scope
        };

        info!("Connecting to server '{}'...", scope.address);

        let attempt = match self.inner.open(&scope).await {
            Ok(stream) => self.inner.init(&scope, stream).await,
            Err(e) => Err(e),
        };

        match attempt {
            Ok(()) => Ok(true),
            Err(ProxyError::Cancelled) => Err(ProxyError::Cancelled),
            Err(e) if scope.reconnects() => {
                warn!("Failed to connect to server '{}': {}", scope.address, e);
                if self.inner.set_state_for(&scope, ConnectionState::Reconnecting) {
                    Inner::start_reconnection_loop(&self.inner, scope);
                }
                Ok(false)
            }
            Err(e) => {
                self.inner.clear_scope(&scope);
                Err(e)
            }
        }
    }

    /// Disconnect from the server and stop reconnecting
    pub async fn disconnect(&self) -> Result<(), ProxyError> {
        let scope = lock(&self.inner.scope)
            .take()
            .ok_or(ProxyError::NotConnected)?;
        scope.cancel();

        let link = {
            let mut link = lock(&self.inner.link);
            let taken = link.take();
            if taken.is_some() {
                self.inner.registry.detach_sink();
            }
            taken
        };
        if let Some(link) = link {
            link.detach.cancel();
            link.handle.close().await;
        }

        self.inner.state.send_replace(ConnectionState::Idle);
        info!("Disconnected from server '{}'", scope.address);

        self.inner
            .publish_event(DisconnectedFromServerEvent::explicit())
            .await;
        Ok(())
    }

    /// Whether `connect` has been called without a matching `disconnect`
    pub fn is_connected_or_connecting(&self) -> bool {
        lock(&self.inner.scope).is_some()
    }

    /// Current connection state
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver observing every connection state change
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Subscribe a handler to messages of type `M` from the server
    ///
    /// The server is asked to forward `M` when its first local handler
    /// subscribes. While disconnected the request is deferred to the next
    /// successful connect.
    pub fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<(), ProxyError> {
        self.inner.registry.subscribe(handler).map(|_| ())
    }

    /// Like [`subscribe`](Self::subscribe), reporting failure as `false`
    pub fn try_subscribe<M: Message>(&self, handler: Handler<M>) -> bool {
        match self.subscribe(handler) {
            Ok(()) => true,
            Err(e) => {
                trace!("Failed to subscribe to '{}': {}", M::TYPE_ID, e);
                false
            }
        }
    }

    /// Remove a handler; the server stops forwarding `M` with the last one
    ///
    /// Returns `false` if the handler was not subscribed.
    pub fn unsubscribe<M: Message>(&self, handler: &Handler<M>) -> bool {
        self.inner.registry.unsubscribe(handler)
    }

    /// Types with at least one local handler
    pub fn subscriptions(&self) -> Vec<String> {
        self.inner.registry.active_types()
    }

    /// Send a message to the server, which publishes it on its hub
    pub fn publish<M: Message>(&self, message: &M) -> Result<(), ProxyError> {
        let handle = lock(&self.inner.link)
            .as_ref()
            .map(|link| link.handle.clone())
            .ok_or(ProxyError::NotConnected)?;
        let payload = encode_payload(message)?;
        handle.send_frame(&Frame::message(M::TYPE_ID, payload))?;
        trace!("Published '{}' to server", M::TYPE_ID);
        Ok(())
    }

    /// Wait for the next message of type `M` from the server
    pub async fn when<M: Message>(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<M, CorrelationError> {
        correlator::when(self, timeout, cancel).await
    }

    /// Publish `request` on the local hub and wait for the next `Resp`
    ///
    /// The reply may come from a local responder or be forwarded by the
    /// server; waiting subscribes `Resp` on both.
    pub async fn process<Req: Message, Resp: Message>(
        &self,
        request: Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resp, CorrelationError> {
        correlator::process(self, request, timeout, cancel).await
    }

    /// Send `request` to the server and wait for the next `Resp` it forwards
    ///
    /// Fails with [`ProxyError::NotConnected`] while no session is live.
    pub async fn process_remote<Req: Message, Resp: Message>(
        &self,
        request: Req,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<Resp, CorrelationError> {
        correlator::process(&RemoteRoute(self), request, timeout, cancel).await
    }
}

#[async_trait]
impl Bus for RemotePubSubProxy {
    fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<(), ProxyError> {
        RemotePubSubProxy::subscribe(self, handler)
    }

    fn unsubscribe<M: Message>(&self, handler: &Handler<M>) {
        RemotePubSubProxy::unsubscribe(self, handler);
    }

    async fn publish<M: Message>(&self, message: M) -> Result<(), ProxyError> {
        // Subscriber failures are logged by the hub and stay with the subscriber
        let _ = self.inner.hub.publish(message).await;
        Ok(())
    }
}

/// Waits like the proxy but publishes to the server
struct RemoteRoute<'a>(&'a RemotePubSubProxy);

#[async_trait]
impl Bus for RemoteRoute<'_> {
    fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<(), ProxyError> {
        self.0.subscribe(handler)
    }

    fn unsubscribe<M: Message>(&self, handler: &Handler<M>) {
        self.0.unsubscribe(handler);
    }

    async fn publish<M: Message>(&self, message: M) -> Result<(), ProxyError> {
        self.0.publish(&message)
    }
}

impl Inner {
    async fn open(&self, scope: &ConnectionScope) -> Result<IoStream, ProxyError> {
        let stream = open_stream(
            self.connector.as_ref(),
            &scope.address,
            scope.connect_timeout(),
            scope.cancel_token(),
        )
        .await?;
        Ok(stream)
    }

    /// Wire up a fresh stream: read loop, resubscribe pass, notifications
    async fn init(
        self: &Arc<Self>,
        scope: &Arc<ConnectionScope>,
        stream: IoStream,
    ) -> Result<(), ProxyError> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let handle = Session::spawn(stream, self.session_config.clone(), event_tx);

        let resent = {
            let mut link = lock(&self.link);
            // disconnect() cancels before it takes the link
            if scope.is_cancelled() {
                None
            } else {
                let detach = scope.cancel_token().child_token();
                *link = Some(SessionLink {
                    handle: handle.clone(),
                    detach: detach.clone(),
                });
                tokio::spawn(Self::pump(
                    Arc::downgrade(self),
                    handle.clone(),
                    scope.clone(),
                    detach,
                    event_rx,
                ));
                let resent = self.registry.attach_sink(Arc::new(handle.clone()));
                self.set_state_for(scope, ConnectionState::Connected);
                Some(resent)
            }
        };

        let Some(resent) = resent else {
            handle.close().await;
            return Err(ProxyError::Cancelled);
        };

        debug!("Resubscribed {} message types on server '{}'", resent, scope.address);
        info!("Connected to server '{}'", scope.address);

        self.publish_event(ConnectedToServerEvent::now()).await;
        Ok(())
    }

    /// Forward session events until the session ends or is detached
    async fn pump(
        inner: Weak<Inner>,
        handle: SessionHandle,
        scope: Arc<ConnectionScope>,
        detach: CancellationToken,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        // One dispatcher per session keeps delivery in arrival order while
        // the pump stays free to notice a drop
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch_loop(inner.clone(), dispatch_rx));

        loop {
            let event = tokio::select! {
                biased;
                _ = detach.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(inner) = inner.upgrade() else {
                break;
            };
            match event {
                Some(SessionEvent::Frame(frame)) => {
                    let _ = dispatch_tx.send(frame);
                }
                Some(SessionEvent::Disconnected { reason }) => {
                    inner.on_session_lost(&handle, &scope, &reason).await;
                    break;
                }
                None => break,
            }
        }
        trace!("Session {} event pump stopped", handle.id());
    }

    /// Publish inbound frames one at a time
    async fn dispatch_loop(inner: Weak<Inner>, mut frames: mpsc::UnboundedReceiver<Frame>) {
        while let Some(frame) = frames.recv().await {
            let Some(inner) = inner.upgrade() else {
                break;
            };
            inner.dispatch(frame).await;
        }
    }

    async fn dispatch(&self, frame: Frame) {
        if frame.kind != FrameKind::Message {
            debug!("Ignoring {:?} frame for '{}' from server", frame.kind, frame.type_id);
            return;
        }
        if let Err(e) = self.deliver(&frame).await {
            warn!("Dropping message '{}' from server: {}", frame.type_id, e);
        }
    }

    async fn deliver(&self, frame: &Frame) -> Result<(), ProxyError> {
        let codec = self
            .registry
            .codec_for(&frame.type_id)
            .ok_or_else(|| ProxyError::UnknownMessageType(frame.type_id.clone()))?;
        let message = codec.decode(&frame.payload)?;
        // Subscriber failures are logged by the hub
        let _ = self.hub.publish_erased(&frame.type_id, message).await;
        Ok(())
    }

    async fn on_session_lost(
        self: &Arc<Self>,
        handle: &SessionHandle,
        scope: &Arc<ConnectionScope>,
        reason: &str,
    ) {
        {
            let mut link = lock(&self.link);
            match link.as_ref() {
                Some(current) if current.handle.id() == handle.id() => {
                    *link = None;
                    self.registry.detach_sink();
                }
                _ => return,
            }
        }

        let next = if scope.reconnects() {
            ConnectionState::Reconnecting
        } else {
            ConnectionState::Lost
        };
        if !self.set_state_for(scope, next) {
            return;
        }

        warn!("Lost connection to server '{}': {}", scope.address, reason);
        if scope.reconnects() {
            Self::start_reconnection_loop(self, scope.clone());
        }

        self.publish_event(DisconnectedFromServerEvent::lost()).await;
    }

    /// Start the reconnection loop unless one is already running
    fn start_reconnection_loop(self: &Arc<Self>, scope: Arc<ConnectionScope>) {
        if self
            .reconnecting
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Reconnection loop to the server '{}' already running", scope.address);
            return;
        }

        info!("Starting reconnection loop to the server '{}'", scope.address);
        let flag = self.reconnecting.clone();
        let inner = Arc::downgrade(self);
        tokio::spawn(async move {
            let reconnected = {
                let _guard = ReconnectGuard(&flag);
                Self::reconnection_loop(&inner, &scope).await
            };
            info!("Finished reconnection loop to the server '{}'", scope.address);

            // A drop between init and the flag release found the loop still running
            if reconnected {
                if let Some(inner) = inner.upgrade() {
                    inner.resume_if_lost(&scope);
                }
            }
        });
    }

    /// Returns `true` when the loop ended with an established session
    async fn reconnection_loop(inner: &Weak<Inner>, scope: &Arc<ConnectionScope>) -> bool {
        let period = scope.reconnect_period();
        loop {
            tokio::select! {
                biased;
                _ = scope.cancel_token().cancelled() => return false,
                _ = tokio::time::sleep(period) => {}
            }

            let Some(inner) = inner.upgrade() else {
                return false;
            };
            debug!("Reconnecting to server '{}'...", scope.address);

            let attempt = match inner.open(scope).await {
                Ok(stream) => inner.init(scope, stream).await,
                Err(e) => Err(e),
            };
            match attempt {
                Ok(()) => return true,
                Err(ProxyError::Cancelled) => return false,
                Err(e) => debug!("Reconnection attempt to '{}' failed: {}", scope.address, e),
            }
        }
    }

    fn resume_if_lost(self: &Arc<Self>, scope: &Arc<ConnectionScope>) {
        let lost = lock(&self.link).is_none();
        if lost && !scope.is_cancelled() && self.is_current(scope) {
            Self::start_reconnection_loop(self, scope.clone());
        }
    }

    fn is_current(&self, scope: &Arc<ConnectionScope>) -> bool {
        matches!(lock(&self.scope).as_ref(), Some(current) if Arc::ptr_eq(current, scope))
    }

    /// Set the state if `scope` is still the proxy's scope
    fn set_state_for(&self, scope: &Arc<ConnectionScope>, state: ConnectionState) -> bool {
        let current = lock(&self.scope);
        match current.as_ref() {
            Some(current) if Arc::ptr_eq(current, scope) => {
                self.state.send_replace(state);
                true
            }
            _ => false,
        }
    }

    fn clear_scope(&self, scope: &Arc<ConnectionScope>) {
        let mut current = lock(&self.scope);
        if matches!(current.as_ref(), Some(existing) if Arc::ptr_eq(existing, scope)) {
            *current = None;
            self.state.send_replace(ConnectionState::Idle);
        }
    }

    async fn publish_event<M: Message>(&self, event: M) {
        if let Err(e) = self.hub.publish(event).await {
            error!("Some of the subscribers of {} failed: {}", M::TYPE_ID, e);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(scope) = lock(&self.scope).take() {
            scope.cancel();
        }
        if let Some(link) = lock(&self.link).take() {
            link.handle.shutdown();
        }
    }
}
