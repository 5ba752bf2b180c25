//! Subscriber handlers and their identity.

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

use crate::error::HandlerError;
use crate::message::{ErasedMessage, Message};

/// Future returned by every handler
pub type HandlerFuture = BoxFuture<'static, Result<(), HandlerError>>;

/// Handles messages of one type
pub trait MessageHandler<M: Message>: Send + Sync + 'static {
    /// Process one message
    fn handle(&self, message: Arc<M>) -> HandlerFuture;
}

/// Shared handler reference; its allocation is its identity
pub type Handler<M> = Arc<dyn MessageHandler<M>>;

/// Handler over type-erased messages
pub type RawHandler = Arc<dyn Fn(ErasedMessage) -> HandlerFuture + Send + Sync>;

/// Identity of a handler registration
///
/// Two clones of the same `Arc` have the same id. Ids are only meaningful
/// while the handler is alive, which routes guarantee by holding a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(usize);

impl HandlerId {
    /// Identity of a shared handler
    pub fn of<T: ?Sized>(handler: &Arc<T>) -> Self {
        HandlerId(Arc::as_ptr(handler) as *const () as usize)
    }
}

struct FnHandler<F>(F);

impl<M, F, Fut> MessageHandler<M> for FnHandler<F>
where
    M: Message,
    F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    fn handle(&self, message: Arc<M>) -> HandlerFuture {
        Box::pin((self.0)(message))
    }
}

/// Build a handler from an async closure
pub fn handler_fn<M, F, Fut>(f: F) -> Handler<M>
where
    M: Message,
    F: Fn(Arc<M>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

/// Adapt a typed handler to an erased route
pub(crate) fn erase<M: Message>(handler: Handler<M>) -> RawHandler {
    Arc::new(move |message: ErasedMessage| -> HandlerFuture {
        match message.downcast::<M>() {
            Ok(message) => handler.handle(message),
            Err(_) => Box::pin(async {
                Err(HandlerError::TypeMismatch {
                    expected: M::TYPE_ID,
                })
            }),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct Ping;

    impl Message for Ping {
        const TYPE_ID: &'static str = "test.Ping";
    }

    #[test]
    fn test_handler_identity() {
        let a = handler_fn(|_: Arc<Ping>| async { Ok(()) });
        let b = handler_fn(|_: Arc<Ping>| async { Ok(()) });
        let a2 = a.clone();

        assert_eq!(HandlerId::of(&a), HandlerId::of(&a2));
        assert_ne!(HandlerId::of(&a), HandlerId::of(&b));
    }

    #[tokio::test]
    async fn test_erased_handler_rejects_other_types() {
        let raw = erase(handler_fn(|_: Arc<Ping>| async { Ok(()) }));
        assert_eq!(raw(Arc::new(Ping)).await, Ok(()));
        assert_eq!(
            raw(Arc::new(42u32)).await,
            Err(HandlerError::TypeMismatch {
                expected: "test.Ping"
            })
        );
    }
}
