//! Subscription registry: local interest per message type, mirrored to the peer.
//!
//! The registry is the only long-lived shared structure of a proxy. Every
//! mutation, the hub (un)subscription it implies, and the control message
//! it emits happen under one lock, so control messages for a type leave in
//! the order of the registry's 0→1 and 1→0 transitions and a resubscribe
//! pass is never interleaved with live ones.

use bridge_hub::{Handler, HandlerId, Message, MessageCodec, MessageHub};
use bridge_session::{SessionError, SessionHandle};
use bridge_wire::{validate_type_id, ControlMessage};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, trace};

use crate::error::ProxyError;

/// Destination of control messages
pub trait ControlSink: Send + Sync {
    /// Send one control message to the peer
    fn send_control(&self, message: &ControlMessage) -> Result<(), SessionError>;
}

impl ControlSink for SessionHandle {
    fn send_control(&self, message: &ControlMessage) -> Result<(), SessionError> {
        self.send_frame(&message.clone().into_frame())
    }
}

struct Node {
    codec: MessageCodec,
    subscribers: Vec<HandlerId>,
}

#[derive(Default)]
struct State {
    // Nodes are kept when they empty; the codec stays usable for inbound frames
    nodes: BTreeMap<String, Node>,
    sink: Option<Arc<dyn ControlSink>>,
}

/// Tracks local subscribers per message type
pub struct SubscriptionRegistry {
    hub: Arc<MessageHub>,
    state: Mutex<State>,
}

impl SubscriptionRegistry {
    /// Create a registry whose handlers live on `hub`
    pub fn new(hub: Arc<MessageHub>) -> Self {
        Self {
            hub,
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Send a control message, deferring it to the next resubscribe pass on failure
    fn emit(sink: &Option<Arc<dyn ControlSink>>, message: ControlMessage) {
        let Some(sink) = sink else {
            trace!(type_id = %message.type_id, op = ?message.op, "Not connected, control message deferred");
            return;
        };
        if let Err(e) = sink.send_control(&message) {
            debug!(type_id = %message.type_id, op = ?message.op, "Control message deferred: {}", e);
        }
    }

    /// Register a handler for `M`
    ///
    /// Returns `Ok(false)` if the handler was already registered. The peer is
    /// told about the type when its first handler arrives; while disconnected
    /// that happens on the next successful connect instead.
    pub fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<bool, ProxyError> {
        validate_type_id(M::TYPE_ID)?;

        let id = HandlerId::of(&handler);
        let mut guard = self.lock();
        let State { nodes, sink } = &mut *guard;

        let node = nodes.entry(M::TYPE_ID.to_string()).or_insert_with(|| Node {
            codec: MessageCodec::of::<M>(),
            subscribers: Vec::new(),
        });
        if node.subscribers.contains(&id) {
            return Ok(false);
        }

        node.subscribers.push(id);
        self.hub.subscribe(handler);

        if node.subscribers.len() == 1 {
            Self::emit(sink, ControlMessage::subscribe(M::TYPE_ID));
            debug!("Subscribed on server: '{}'", M::TYPE_ID);
        }
        Ok(true)
    }

    /// Remove a handler for `M`
    ///
    /// Returns `false` if the handler was not registered. The peer is told
    /// when the type loses its last handler.
    pub fn unsubscribe<M: Message>(&self, handler: &Handler<M>) -> bool {
        let id = HandlerId::of(handler);
        let mut guard = self.lock();
        let State { nodes, sink } = &mut *guard;

        let Some(node) = nodes.get_mut(M::TYPE_ID) else {
            return false;
        };
        let before = node.subscribers.len();
        node.subscribers.retain(|existing| *existing != id);
        if node.subscribers.len() == before {
            return false;
        }

        self.hub.unsubscribe(handler);

        if node.subscribers.is_empty() {
            Self::emit(sink, ControlMessage::unsubscribe(M::TYPE_ID));
            debug!("Unsubscribed on server: '{}'", M::TYPE_ID);
        }
        true
    }

    /// Route control messages to `sink` and replay every active type to it
    ///
    /// Returns the number of types resubscribed.
    pub fn attach_sink(&self, sink: Arc<dyn ControlSink>) -> usize {
        let mut guard = self.lock();
        let State { nodes, sink: current } = &mut *guard;

        let mut resent = 0;
        for (type_id, node) in nodes.iter() {
            if node.subscribers.is_empty() {
                continue;
            }
            if let Err(e) = sink.send_control(&ControlMessage::subscribe(type_id.as_str())) {
                debug!(type_id = %type_id, "Resubscribe deferred: {}", e);
                continue;
            }
            resent += 1;
        }
        *current = Some(sink);
        resent
    }

    /// Stop routing control messages; they are deferred until the next attach
    pub fn detach_sink(&self) {
        self.lock().sink = None;
    }

    /// Whether control messages currently reach a peer
    pub fn has_sink(&self) -> bool {
        self.lock().sink.is_some()
    }

    /// Codec of a type that has been subscribed at least once
    pub fn codec_for(&self, type_id: &str) -> Option<MessageCodec> {
        self.lock().nodes.get(type_id).map(|node| node.codec)
    }

    /// Types with at least one handler, in key order
    pub fn active_types(&self) -> Vec<String> {
        self.lock()
            .nodes
            .iter()
            .filter(|(_, node)| !node.subscribers.is_empty())
            .map(|(type_id, _)| type_id.clone())
            .collect()
    }

    /// Handlers registered for a type
    pub fn subscriber_count(&self, type_id: &str) -> usize {
        self.lock()
            .nodes
            .get(type_id)
            .map(|node| node.subscribers.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Alpha, Beta, RecordingSink};
    use bridge_hub::handler_fn;
    use bridge_wire::ControlOp;
    use proptest::prelude::*;
    use serde::{Deserialize, Serialize};

    fn alpha_handler() -> Handler<Alpha> {
        handler_fn(|_: Arc<Alpha>| async { Ok(()) })
    }

    fn beta_handler() -> Handler<Beta> {
        handler_fn(|_: Arc<Beta>| async { Ok(()) })
    }

    fn registry_with_sink() -> (SubscriptionRegistry, Arc<MessageHub>, Arc<RecordingSink>) {
        let hub = Arc::new(MessageHub::new());
        let registry = SubscriptionRegistry::new(hub.clone());
        let sink = Arc::new(RecordingSink::default());
        registry.attach_sink(sink.clone());
        (registry, hub, sink)
    }

    #[test]
    fn test_first_and_last_subscriber_drive_control_messages() {
        let (registry, hub, sink) = registry_with_sink();
        let a = alpha_handler();
        let b = alpha_handler();

        assert!(registry.subscribe(a.clone()).unwrap());
        assert!(registry.subscribe(b.clone()).unwrap());
        assert!(!registry.subscribe(a.clone()).unwrap());
        assert_eq!(registry.subscriber_count(Alpha::TYPE_ID), 2);
        assert_eq!(hub.subscriber_count(Alpha::TYPE_ID), 2);

        assert!(registry.unsubscribe(&a));
        assert!(!registry.unsubscribe(&a));
        assert!(registry.unsubscribe(&b));
        assert_eq!(hub.subscriber_count(Alpha::TYPE_ID), 0);

        assert_eq!(
            sink.take(),
            vec![
                ControlMessage::subscribe(Alpha::TYPE_ID),
                ControlMessage::unsubscribe(Alpha::TYPE_ID),
            ]
        );
    }

    #[test]
    fn test_unsubscribe_of_unknown_type_is_a_noop() {
        let (registry, _hub, sink) = registry_with_sink();
        assert!(!registry.unsubscribe(&beta_handler()));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_subscribe_while_detached_is_deferred_to_attach() {
        let hub = Arc::new(MessageHub::new());
        let registry = SubscriptionRegistry::new(hub);
        let alpha = alpha_handler();
        let beta = beta_handler();

        registry.subscribe(alpha).unwrap();
        registry.subscribe(beta.clone()).unwrap();
        registry.unsubscribe(&beta);
        assert!(!registry.has_sink());

        let sink = Arc::new(RecordingSink::default());
        assert_eq!(registry.attach_sink(sink.clone()), 1);
        assert_eq!(sink.take(), vec![ControlMessage::subscribe(Alpha::TYPE_ID)]);
        assert!(registry.codec_for(Beta::TYPE_ID).is_some());
    }

    #[test]
    fn test_send_failures_do_not_reach_the_caller() {
        let hub = Arc::new(MessageHub::new());
        let registry = SubscriptionRegistry::new(hub);
        let sink = Arc::new(RecordingSink::failing());
        registry.attach_sink(sink.clone());

        let handler = alpha_handler();
        assert!(registry.subscribe(handler.clone()).is_ok());
        assert!(registry.unsubscribe(&handler));
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_invalid_type_id_is_rejected_without_side_effects() {
        #[derive(Debug, Clone, Serialize, Deserialize)]
        struct Nameless;
        impl Message for Nameless {
            const TYPE_ID: &'static str = "";
        }

        let (registry, hub, sink) = registry_with_sink();
        let handler = handler_fn(|_: Arc<Nameless>| async { Ok(()) });
        assert!(matches!(
            registry.subscribe(handler),
            Err(ProxyError::Wire(bridge_wire::WireError::EmptyTypeId))
        ));
        assert!(registry.active_types().is_empty());
        assert_eq!(hub.subscriber_count(""), 0);
        assert!(sink.take().is_empty());
    }

    #[test]
    fn test_resubscribe_replays_active_types_in_key_order() {
        let (registry, _hub, first) = registry_with_sink();
        registry.subscribe(beta_handler()).unwrap();
        registry.subscribe(alpha_handler()).unwrap();
        first.take();

        let second = Arc::new(RecordingSink::default());
        assert_eq!(registry.attach_sink(second.clone()), 2);
        assert_eq!(
            second.take(),
            vec![
                ControlMessage::subscribe(Alpha::TYPE_ID),
                ControlMessage::subscribe(Beta::TYPE_ID),
            ]
        );
        assert!(first.take().is_empty());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Subscribe { beta: bool, handler: usize },
        Unsubscribe { beta: bool, handler: usize },
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        (any::<bool>(), 0usize..3, any::<bool>()).prop_map(|(beta, handler, subscribe)| {
            if subscribe {
                Op::Subscribe { beta, handler }
            } else {
                Op::Unsubscribe { beta, handler }
            }
        })
    }

    fn check_control_stream(messages: &[ControlMessage], type_id: &str, active: bool) {
        let ops: Vec<ControlOp> = messages
            .iter()
            .filter(|m| m.type_id == type_id)
            .map(|m| m.op)
            .collect();
        for (i, op) in ops.iter().enumerate() {
            let expected = if i % 2 == 0 {
                ControlOp::Subscribe
            } else {
                ControlOp::Unsubscribe
            };
            assert_eq!(*op, expected, "control stream for {} out of order: {:?}", type_id, ops);
        }
        assert_eq!(ops.len() % 2 == 1, active, "final control op for {} disagrees with registry", type_id);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_concurrent_operations_mirror_transitions(
            threads in prop::collection::vec(prop::collection::vec(op_strategy(), 1..24), 2..5)
        ) {
            let (registry, hub, sink) = registry_with_sink();
            let alphas: Vec<Handler<Alpha>> = (0..3).map(|_| alpha_handler()).collect();
            let betas: Vec<Handler<Beta>> = (0..3).map(|_| beta_handler()).collect();

            std::thread::scope(|s| {
                for ops in &threads {
                    let registry = &registry;
                    let alphas = &alphas;
                    let betas = &betas;
                    s.spawn(move || {
                        for op in ops {
                            match *op {
                                Op::Subscribe { beta: false, handler } => {
                                    registry.subscribe(alphas[handler].clone()).unwrap();
                                }
                                Op::Subscribe { beta: true, handler } => {
                                    registry.subscribe(betas[handler].clone()).unwrap();
                                }
                                Op::Unsubscribe { beta: false, handler } => {
                                    registry.unsubscribe(&alphas[handler]);
                                }
                                Op::Unsubscribe { beta: true, handler } => {
                                    registry.unsubscribe(&betas[handler]);
                                }
                            }
                        }
                    });
                }
            });

            let messages = sink.take();
            for type_id in [Alpha::TYPE_ID, Beta::TYPE_ID] {
                let count = registry.subscriber_count(type_id);
                prop_assert!(count <= 3);
                prop_assert_eq!(count, hub.subscriber_count(type_id));
                check_control_stream(&messages, type_id, count > 0);
            }
        }
    }
}
