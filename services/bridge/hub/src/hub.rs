//! The process-local message hub.

use dashmap::DashMap;
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tracing::{error, trace};

use crate::error::{HandlerError, HubError};
use crate::handler::{erase, Handler, HandlerId, RawHandler};
use crate::message::{ErasedMessage, Message};

struct Route {
    id: HandlerId,
    call: RawHandler,
}

/// Process-local publish/subscribe bus keyed by message type id
///
/// Subscribing and unsubscribing never suspend. Publishing runs every
/// subscriber of the type concurrently; a failing or panicking subscriber
/// does not prevent the others from running.
#[derive(Default)]
pub struct MessageHub {
    routes: DashMap<String, Vec<Route>>,
}

impl MessageHub {
    /// Create an empty hub
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a handler to messages of type `M`
    ///
    /// Returns `false` if the same handler is already subscribed.
    pub fn subscribe<M: Message>(&self, handler: Handler<M>) -> bool {
        let id = HandlerId::of(&handler);
        self.subscribe_raw(M::TYPE_ID, id, erase(handler))
    }

    /// Remove a handler from messages of type `M`
    ///
    /// Returns `false` if the handler was not subscribed.
    pub fn unsubscribe<M: Message>(&self, handler: &Handler<M>) -> bool {
        self.unsubscribe_raw(M::TYPE_ID, HandlerId::of(handler))
    }

    /// Subscribe an erased handler under an explicit identity
    pub fn subscribe_raw(&self, type_id: &str, id: HandlerId, handler: RawHandler) -> bool {
        let mut routes = self.routes.entry(type_id.to_string()).or_default();
        if routes.iter().any(|route| route.id == id) {
            return false;
        }
        routes.push(Route { id, call: handler });
        trace!(type_id, subscribers = routes.len(), "Hub subscription added");
        true
    }

    /// Remove an erased handler by identity
    pub fn unsubscribe_raw(&self, type_id: &str, id: HandlerId) -> bool {
        let (removed, now_empty) = match self.routes.get_mut(type_id) {
            Some(mut routes) => {
                let before = routes.len();
                routes.retain(|route| route.id != id);
                (routes.len() != before, routes.is_empty())
            }
            None => return false,
        };
        if now_empty {
            self.routes.remove_if(type_id, |_, routes| routes.is_empty());
        }
        if removed {
            trace!(type_id, "Hub subscription removed");
        }
        removed
    }

    /// Number of handlers subscribed to a type id
    pub fn subscriber_count(&self, type_id: &str) -> usize {
        self.routes.get(type_id).map(|routes| routes.len()).unwrap_or(0)
    }

    /// Publish a message to every subscriber of its type
    ///
    /// Returns the number of handlers invoked.
    pub async fn publish<M: Message>(&self, message: M) -> Result<usize, HubError> {
        self.publish_erased(M::TYPE_ID, Arc::new(message)).await
    }

    /// Publish an erased message under an explicit type id
    pub async fn publish_erased(
        &self,
        type_id: &str,
        message: ErasedMessage,
    ) -> Result<usize, HubError> {
        // Handlers may (un)subscribe while running, so never hold the route lock
        let snapshot: Vec<RawHandler> = match self.routes.get(type_id) {
            Some(routes) => routes.iter().map(|route| route.call.clone()).collect(),
            None => Vec::new(),
        };

        if snapshot.is_empty() {
            trace!(type_id, "No subscribers for published message");
            return Ok(0);
        }

        let total = snapshot.len();
        let results = join_all(snapshot.iter().map(|call| {
            let outcome = AssertUnwindSafe(call(message.clone())).catch_unwind();
            async move { outcome.await.unwrap_or(Err(HandlerError::Panicked)) }
        }))
        .await;

        let errors: Vec<HandlerError> = results.into_iter().filter_map(Result::err).collect();
        for e in &errors {
            error!(type_id, error = %e, "Handler failed");
        }

        if errors.is_empty() {
            Ok(total)
        } else {
            Err(HubError::HandlerFailures {
                type_id: type_id.to_string(),
                total,
                errors,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::handler_fn;
    use serde::{Deserialize, Serialize};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Tick(u32);

    impl Message for Tick {
        const TYPE_ID: &'static str = "test.Tick";
    }

    fn counting(counter: Arc<AtomicUsize>) -> Handler<Tick> {
        handler_fn(move |_: Arc<Tick>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
    }

    #[tokio::test]
    async fn test_subscribe_is_idempotent_per_handler() {
        let hub = MessageHub::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let handler = counting(counter.clone());

        assert!(hub.subscribe(handler.clone()));
        assert!(!hub.subscribe(handler.clone()));
        assert_eq!(hub.subscriber_count(Tick::TYPE_ID), 1);

        assert_eq!(hub.publish(Tick(1)).await.unwrap(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        assert!(hub.unsubscribe(&handler));
        assert!(!hub.unsubscribe(&handler));
        assert_eq!(hub.subscriber_count(Tick::TYPE_ID), 0);
        assert_eq!(hub.publish(Tick(2)).await.unwrap(), 0);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failures_are_isolated_per_subscriber() {
        let hub = MessageHub::new();
        let counter = Arc::new(AtomicUsize::new(0));

        hub.subscribe(handler_fn(|_: Arc<Tick>| async {
            Err(HandlerError::failed("boom"))
        }));
        hub.subscribe(handler_fn(|tick: Arc<Tick>| async move {
            if tick.0 > 0 {
                panic!("handler blew up");
            }
            Ok(())
        }));
        hub.subscribe(counting(counter.clone()));

        match hub.publish(Tick(1)).await {
            Err(HubError::HandlerFailures { total, errors, .. }) => {
                assert_eq!(total, 3);
                assert_eq!(errors.len(), 2);
                assert!(errors.contains(&HandlerError::Panicked));
                assert!(errors.contains(&HandlerError::Failed("boom".into())));
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_publish_runs_inside_spawned_tasks() {
        let hub = Arc::new(MessageHub::new());
        let counter = Arc::new(AtomicUsize::new(0));
        hub.subscribe(counting(counter.clone()));
        hub.subscribe(handler_fn(|tick: Arc<Tick>| async move {
            if tick.0 < u32::MAX {
                panic!("handler blew up");
            }
            Ok(())
        }));

        let tasks: Vec<_> = (0..4)
            .map(|i| {
                let hub = hub.clone();
                tokio::spawn(async move { hub.publish(Tick(i)).await })
            })
            .collect();

        for task in tasks {
            match task.await.unwrap() {
                Err(HubError::HandlerFailures { total, errors, .. }) => {
                    assert_eq!(total, 2);
                    assert_eq!(errors, vec![HandlerError::Panicked]);
                }
                other => panic!("unexpected result {:?}", other),
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_handler_may_unsubscribe_itself_while_running() {
        let hub = Arc::new(MessageHub::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let slot: Arc<std::sync::Mutex<Option<Handler<Tick>>>> = Arc::default();

        let handler = {
            let hub = hub.clone();
            let slot = slot.clone();
            let counter = counter.clone();
            handler_fn(move |_: Arc<Tick>| {
                let hub = hub.clone();
                let slot = slot.clone();
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if let Some(me) = slot.lock().unwrap().take() {
                        hub.unsubscribe(&me);
                    }
                    Ok(())
                }
            })
        };
        *slot.lock().unwrap() = Some(handler.clone());
        hub.subscribe(handler);

        hub.publish(Tick(1)).await.unwrap();
        hub.publish(Tick(2)).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_raw_routes_share_the_type_namespace() {
        let hub = MessageHub::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let raw: RawHandler = {
            let seen = seen.clone();
            Arc::new(move |message: ErasedMessage| -> crate::HandlerFuture {
                let seen = seen.clone();
                Box::pin(async move {
                    if let Some(tick) = message.downcast_ref::<Tick>() {
                        seen.fetch_add(tick.0 as usize, Ordering::SeqCst);
                    }
                    Ok(())
                })
            })
        };
        let id = HandlerId::of(&raw);

        assert!(hub.subscribe_raw(Tick::TYPE_ID, id, raw.clone()));
        assert!(!hub.subscribe_raw(Tick::TYPE_ID, id, raw));
        hub.publish(Tick(5)).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 5);

        assert!(hub.unsubscribe_raw(Tick::TYPE_ID, id));
        assert_eq!(hub.publish(Tick(5)).await.unwrap(), 0);
    }
}
