//! Request/response correlation over a pub/sub bus.
//!
//! Each call registers an ephemeral subscription for the expected type,
//! resolves on the first matching message, and removes the subscription
//! before returning, however the call ends. Correlation is by type only: two
//! concurrent calls waiting for the same type may each take either reply.

use async_trait::async_trait;
use bridge_hub::{handler_fn, Handler, Message, MessageHub};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::{CorrelationError, ProxyError};

/// A bus the correlator can wait on
#[async_trait]
pub trait Bus: Send + Sync {
    /// Subscribe a handler to `M`
    fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<(), ProxyError>;

    /// Remove a handler from `M`
    fn unsubscribe<M: Message>(&self, handler: &Handler<M>);

    /// Publish a message
    async fn publish<M: Message>(&self, message: M) -> Result<(), ProxyError>;
}

#[async_trait]
impl Bus for MessageHub {
    fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<(), ProxyError> {
        MessageHub::subscribe(self, handler);
        Ok(())
    }

    fn unsubscribe<M: Message>(&self, handler: &Handler<M>) {
        MessageHub::unsubscribe(self, handler);
    }

    async fn publish<M: Message>(&self, message: M) -> Result<(), ProxyError> {
        // Subscriber failures are logged by the hub and stay with the subscriber
        let _ = MessageHub::publish(self, message).await;
        Ok(())
    }
}

/// An outstanding call: a single-assignment slot and its ephemeral subscription
struct PendingCall<'a, B: Bus, M: Message> {
    bus: &'a B,
    handler: Handler<M>,
    result: oneshot::Receiver<Arc<M>>,
}

impl<'a, B: Bus, M: Message> PendingCall<'a, B, M> {
    fn register(bus: &'a B) -> Result<Self, CorrelationError> {
        let (tx, result) = oneshot::channel();
        let slot = Arc::new(Mutex::new(Some(tx)));

        let handler = handler_fn(move |message: Arc<M>| {
            let sender = slot
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take();
            async move {
                if let Some(sender) = sender {
                    let _ = sender.send(message);
                }
                Ok(())
            }
        });

        bus.subscribe(handler.clone())
            .map_err(CorrelationError::Subscribe)?;
        trace!(type_id = M::TYPE_ID, "Waiting for message");

        Ok(Self {
            bus,
            handler,
            result,
        })
    }

    async fn wait(
        mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<M, CorrelationError> {
        let outcome = tokio::select! {
            biased;

            _ = cancel.cancelled() => Err(CorrelationError::Cancelled),

            received = tokio::time::timeout(timeout, &mut self.result) => match received {
                Ok(Ok(message)) => Ok(message),
                // The slot lives as long as the subscription, so this is unreachable
                Ok(Err(_)) => Err(CorrelationError::Cancelled),
                Err(_) => Err(CorrelationError::Timeout(timeout)),
            },
        };
        drop(self);

        outcome.map(|message| Arc::try_unwrap(message).unwrap_or_else(|shared| (*shared).clone()))
    }
}

impl<B: Bus, M: Message> Drop for PendingCall<'_, B, M> {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.handler);
    }
}

/// Wait for the next message of type `M`
pub async fn when<B, M>(
    bus: &B,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<M, CorrelationError>
where
    B: Bus,
    M: Message,
{
    PendingCall::<B, M>::register(bus)?
        .wait(timeout, cancel)
        .await
}

/// Publish `request` and wait for the next message of type `Resp`
///
/// The response subscription is registered before the request is published,
/// so a reply cannot slip past.
pub async fn process<B, Req, Resp>(
    bus: &B,
    request: Req,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<Resp, CorrelationError>
where
    B: Bus,
    Req: Message,
    Resp: Message,
{
    let pending = PendingCall::<B, Resp>::register(bus)?;
    bus.publish(request)
        .await
        .map_err(CorrelationError::Publish)?;
    pending.wait(timeout, cancel).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{Alpha, Beta};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn responder(hub: &Arc<MessageHub>, requests: Arc<AtomicUsize>) {
        let replies = hub.clone();
        hub.subscribe(handler_fn(move |request: Arc<Alpha>| {
            let replies = replies.clone();
            let requests = requests.clone();
            async move {
                requests.fetch_add(1, Ordering::SeqCst);
                let _ = replies.publish(Beta { value: request.value * 10 }).await;
                Ok(())
            }
        }));
    }

    #[tokio::test]
    async fn test_when_resolves_with_first_message() {
        let hub = Arc::new(MessageHub::new());
        let cancel = CancellationToken::new();

        let waiter = {
            let hub = hub.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                when::<_, Beta>(hub.as_ref(), Duration::from_secs(5), &cancel).await
            })
        };
        while hub.subscriber_count(Beta::TYPE_ID) == 0 {
            tokio::task::yield_now().await;
        }

        hub.publish(Beta { value: 1 }).await.unwrap();
        hub.publish(Beta { value: 2 }).await.unwrap();

        let received = waiter.await.unwrap().unwrap();
        assert_eq!(received, Beta { value: 1 });
        assert_eq!(hub.subscriber_count(Beta::TYPE_ID), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_times_out_without_leaking_the_subscription() {
        let hub = MessageHub::new();
        let cancel = CancellationToken::new();

        let result = when::<_, Beta>(&hub, Duration::from_millis(50), &cancel).await;
        assert!(matches!(result, Err(CorrelationError::Timeout(d)) if d == Duration::from_millis(50)));

        assert_eq!(hub.subscriber_count(Beta::TYPE_ID), 0);
        assert_eq!(hub.publish(Beta { value: 3 }).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_when_cancelled_by_token() {
        let hub = MessageHub::new();
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let result = when::<_, Beta>(&hub, Duration::from_secs(60), &cancel).await;
        assert!(matches!(result, Err(CorrelationError::Cancelled)));
        assert_eq!(hub.subscriber_count(Beta::TYPE_ID), 0);
    }

    #[tokio::test]
    async fn test_process_publishes_once_and_returns_reply() {
        let hub = Arc::new(MessageHub::new());
        let requests = Arc::new(AtomicUsize::new(0));
        responder(&hub, requests.clone());
        let cancel = CancellationToken::new();

        let reply: Beta = process(hub.as_ref(), Alpha { value: 4 }, Duration::from_secs(1), &cancel)
            .await
            .unwrap();

        assert_eq!(reply, Beta { value: 40 });
        assert_eq!(requests.load(Ordering::SeqCst), 1);
        assert_eq!(hub.subscriber_count(Beta::TYPE_ID), 0);
    }

    #[tokio::test]
    async fn test_concurrent_process_calls_resolve_independently() {
        let hub = Arc::new(MessageHub::new());
        let requests = Arc::new(AtomicUsize::new(0));
        responder(&hub, requests.clone());

        let calls: Vec<_> = (1..=2)
            .map(|value| {
                let hub = hub.clone();
                tokio::spawn(async move {
                    let cancel = CancellationToken::new();
                    process::<_, Alpha, Beta>(hub.as_ref(), Alpha { value }, Duration::from_secs(5), &cancel)
                        .await
                })
            })
            .collect();

        for call in calls {
            let reply = call.await.unwrap().unwrap();
            assert!(reply.value == 10 || reply.value == 20);
        }
        assert_eq!(requests.load(Ordering::SeqCst), 2);
        assert_eq!(hub.subscriber_count(Beta::TYPE_ID), 0);
    }

    struct UnreachableBus {
        hub: MessageHub,
    }

    #[async_trait]
    impl Bus for UnreachableBus {
        fn subscribe<M: Message>(&self, handler: Handler<M>) -> Result<(), ProxyError> {
            Bus::subscribe(&self.hub, handler)
        }

        fn unsubscribe<M: Message>(&self, handler: &Handler<M>) {
            Bus::unsubscribe(&self.hub, handler)
        }

        async fn publish<M: Message>(&self, _message: M) -> Result<(), ProxyError> {
            Err(ProxyError::NotConnected)
        }
    }

    #[tokio::test]
    async fn test_publish_failure_tears_down_subscription() {
        let bus = UnreachableBus {
            hub: MessageHub::new(),
        };
        let cancel = CancellationToken::new();

        let result =
            process::<_, Alpha, Beta>(&bus, Alpha { value: 1 }, Duration::from_secs(1), &cancel).await;
        assert!(matches!(
            result,
            Err(CorrelationError::Publish(ProxyError::NotConnected))
        ));
        assert_eq!(bus.hub.subscriber_count(Beta::TYPE_ID), 0);
    }
}
