//! Server side of the bridge: accepts proxies and serves them from a local hub.

use bridge_hub::{
    ErasedMessage, HandlerError, HandlerFuture, HandlerId, Message, MessageCatalog, MessageCodec,
    MessageHub, RawHandler,
};
use bridge_session::{IoStream, Listener, Session, SessionConfig, SessionEvent, SessionHandle};
use bridge_wire::{ControlMessage, ControlOp, Frame, FrameKind};
use dashmap::DashMap;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::events::RemoteClientConnectedEvent;

/// Server configuration
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
    /// Settings applied to every client session
    pub session: SessionConfig,
}

struct Client {
    session: SessionHandle,
    // One forwarder per subscribed type
    forwards: HashMap<String, RawHandler>,
}

struct ServerInner {
    hub: Arc<MessageHub>,
    catalog: Arc<MessageCatalog>,
    clients: DashMap<Uuid, Client>,
    config: ServerConfig,
}

/// Serves remote proxies from a local [`MessageHub`]
///
/// Messages of a type a client subscribed to are forwarded to that client;
/// messages a client sends are published on the hub. Only types registered
/// in the server's catalog can cross the bridge.
#[derive(Clone)]
pub struct PubSubServer {
    inner: Arc<ServerInner>,
}

impl PubSubServer {
    /// Create a server over `hub`
    pub fn new(hub: Arc<MessageHub>, config: ServerConfig) -> Self {
        let catalog = MessageCatalog::new();
        catalog.register::<RemoteClientConnectedEvent>();
        Self {
            inner: Arc::new(ServerInner {
                hub,
                catalog: Arc::new(catalog),
                clients: DashMap::new(),
                config,
            }),
        }
    }

    /// Allow messages of type `M` across the bridge
    pub fn register<M: Message>(&self) -> &Self {
        self.inner.catalog.register::<M>();
        self
    }

    /// The server's hub
    pub fn hub(&self) -> &Arc<MessageHub> {
        &self.inner.hub
    }

    /// Types that can cross the bridge
    pub fn catalog(&self) -> &Arc<MessageCatalog> {
        &self.inner.catalog
    }

    /// Number of connected clients
    pub fn client_count(&self) -> usize {
        self.inner.clients.len()
    }

    /// Ids of connected clients
    pub fn clients(&self) -> Vec<Uuid> {
        self.inner.clients.iter().map(|entry| *entry.key()).collect()
    }

    /// Types a client currently subscribes to, sorted
    pub fn subscriptions(&self, client: &Uuid) -> Vec<String> {
        let mut types: Vec<String> = self
            .inner
            .clients
            .get(client)
            .map(|client| client.forwards.keys().cloned().collect())
            .unwrap_or_default();
        types.sort();
        types
    }

    /// Accept clients until `shutdown` fires, then close every session
    pub async fn run<L: Listener>(
        &self,
        mut listener: L,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        info!("Bridge server listening on '{}'", listener.address());

        let result = loop {
            let accepted = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok(stream) => self.accept(stream),
                Err(e) => {
                    error!("Failed to accept client on '{}': {}", listener.address(), e);
                    break Err(e);
                }
            }
        };

        self.close_all().await;
        info!("Bridge server on '{}' stopped", listener.address());
        result
    }

    fn accept(&self, stream: IoStream) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = Session::spawn(stream, self.inner.config.session.clone(), event_tx);
        let client_id = Uuid::new_v4();

        self.inner.clients.insert(
            client_id,
            Client {
                session: session.clone(),
                forwards: HashMap::new(),
            },
        );
        let total = self.inner.clients.len();
        info!(
            "Client {} connected (session {}), {} client(s) total",
            client_id,
            session.id(),
            total
        );

        tokio::spawn(ServerInner::client_loop(self.inner.clone(), client_id, event_rx));

        let hub = self.inner.hub.clone();
        tokio::spawn(async move {
            if let Err(e) = hub.publish(RemoteClientConnectedEvent::new(total)).await {
                error!(
                    "Some of the subscribers of {} failed: {}",
                    RemoteClientConnectedEvent::TYPE_ID,
                    e
                );
            }
        });
    }

    async fn close_all(&self) {
        let ids = self.clients();
        for id in ids {
            if let Some(session) = self.inner.remove_client(&id) {
                session.close().await;
            }
        }
    }
}

impl ServerInner {
    async fn client_loop(
        inner: Arc<ServerInner>,
        client_id: Uuid,
        mut events: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        // Messages from one client are published in arrival order; control
        // frames are handled here without waiting behind them
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::dispatch_loop(inner.clone(), client_id, dispatch_rx));

        while let Some(event) = events.recv().await {
            match event {
                SessionEvent::Frame(frame) => inner.handle_frame(&client_id, frame, &dispatch_tx),
                SessionEvent::Disconnected { reason } => {
                    info!("Client {} disconnected: {}", client_id, reason);
                    break;
                }
            }
        }
        if let Some(session) = inner.remove_client(&client_id) {
            session.shutdown();
        }
    }

    fn handle_frame(&self, client_id: &Uuid, frame: Frame, dispatch: &mpsc::UnboundedSender<Frame>) {
        if frame.kind != FrameKind::Message {
            match ControlMessage::try_from(frame) {
                Ok(control) => self.handle_control(client_id, control),
                Err(e) => warn!("Invalid control frame from client {}: {}", client_id, e),
            }
            return;
        }
        let _ = dispatch.send(frame);
    }

    async fn dispatch_loop(
        inner: Arc<ServerInner>,
        client_id: Uuid,
        mut frames: mpsc::UnboundedReceiver<Frame>,
    ) {
        while let Some(frame) = frames.recv().await {
            if let Err(e) = inner.deliver(&frame).await {
                warn!(
                    "Dropping message '{}' from client {}: {}",
                    frame.type_id, client_id, e
                );
            }
        }
    }

    fn handle_control(&self, client_id: &Uuid, control: ControlMessage) {
        let ControlMessage { type_id, op } = control;
        let Some(mut client) = self.clients.get_mut(client_id) else {
            return;
        };

        match op {
            ControlOp::Subscribe => {
                if client.forwards.contains_key(&type_id) {
                    debug!("Client {} already subscribed to '{}'", client_id, type_id);
                    return;
                }
                let Some(codec) = self.catalog.get(&type_id) else {
                    warn!(
                        "Client {} subscribed to unknown message type '{}'",
                        client_id, type_id
                    );
                    return;
                };
                let forward = forwarder(client.session.clone(), codec);
                self.hub
                    .subscribe_raw(&type_id, HandlerId::of(&forward), forward.clone());
                debug!("Client {} subscribed to '{}'", client_id, type_id);
                client.forwards.insert(type_id, forward);
            }
            ControlOp::Unsubscribe => match client.forwards.remove(&type_id) {
                Some(forward) => {
                    self.hub.unsubscribe_raw(&type_id, HandlerId::of(&forward));
                    debug!("Client {} unsubscribed from '{}'", client_id, type_id);
                }
                None => debug!("Client {} was not subscribed to '{}'", client_id, type_id),
            },
        }
    }

    async fn deliver(&self, frame: &Frame) -> Result<(), ProxyError> {
        let codec = self
            .catalog
            .get(&frame.type_id)
            .ok_or_else(|| ProxyError::UnknownMessageType(frame.type_id.clone()))?;
        let message = codec.decode(&frame.payload)?;
        // Subscriber failures are logged by the hub
        let _ = self.hub.publish_erased(&frame.type_id, message).await;
        Ok(())
    }

    /// Drop a client and its forwarders, returning its session
    fn remove_client(&self, client_id: &Uuid) -> Option<SessionHandle> {
        let (_, client) = self.clients.remove(client_id)?;
        for (type_id, forward) in client.forwards {
            self.hub.unsubscribe_raw(&type_id, HandlerId::of(&forward));
        }
        info!(
            "Client {} removed, {} client(s) remaining",
            client_id,
            self.clients.len()
        );
        Some(client.session)
    }
}

/// Route hub messages of one type to a client session
fn forwarder(session: SessionHandle, codec: MessageCodec) -> RawHandler {
    Arc::new(move |message: ErasedMessage| -> HandlerFuture {
        let result = match codec.encode(&message) {
            Ok(payload) => {
                if let Err(e) = session.send_frame(&Frame::message(codec.type_id(), payload)) {
                    // The client loop removes the forwarder shortly
                    trace!("Not forwarding '{}' to session {}: {}", codec.type_id(), session.id(), e);
                }
                Ok(())
            }
            Err(e) => Err(HandlerError::failed(e)),
        };
        Box::pin(futures::future::ready(result))
    })
}
