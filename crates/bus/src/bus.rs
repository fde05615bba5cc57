//! The transport seam: untyped handlers, the bus trait and typed adapters.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::envelope::{Envelope, Message};
use crate::error::{HandlerError, Result};

/// Receives deliveries for one subscription.
///
/// `Ok` acks the delivery. `Err` nacks it: [`HandlerError::Retry`] asks for a
/// redelivery, [`HandlerError::Malformed`] sends it straight to dead letters.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError>;
}

/// A topic-based, at-least-once message transport.
///
/// Subscribers sharing a `group` compete for deliveries; each group sees
/// every message published to the topic once it has subscribed.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, envelope: Envelope) -> Result<()>;

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()>;
}

/// Typed helpers available on every [`MessageBus`].
#[async_trait]
pub trait MessageBusExt: MessageBus {
    /// Encodes `message` and publishes it on its topic.
    async fn publish_message<M: Message>(&self, message: &M) -> Result<()> {
        let envelope = Envelope::encode(message)?;
        self.publish(M::TOPIC, envelope).await
    }

    /// Subscribes a typed consumer to `M`'s topic.
    async fn subscribe_typed<M, C>(&self, group: &str, consumer: Arc<C>) -> Result<()>
    where
        M: Message,
        C: Consumer<M> + 'static,
    {
        self.subscribe(M::TOPIC, group, Arc::new(TypedHandler::new(consumer)))
            .await
    }
}

impl<T: MessageBus + ?Sized> MessageBusExt for T {}

/// A handler that only ever sees decoded, validated messages.
#[async_trait]
pub trait Consumer<M: Message>: Send + Sync {
    async fn consume(&self, message: M) -> std::result::Result<(), HandlerError>;
}

/// Adapts a [`Consumer`] to the untyped [`MessageHandler`] seam.
pub struct TypedHandler<M, C> {
    consumer: Arc<C>,
    _message: PhantomData<fn() -> M>,
}

impl<M, C> TypedHandler<M, C> {
    pub fn new(consumer: Arc<C>) -> Self {
        Self {
            consumer,
            _message: PhantomData,
        }
    }
}

#[async_trait]
impl<M, C> MessageHandler for TypedHandler<M, C>
where
    M: Message,
    C: Consumer<M>,
{
    async fn handle(&self, envelope: &Envelope) -> std::result::Result<(), HandlerError> {
        let message = envelope.decode::<M>()?;
        self.consumer.consume(message).await
    }
}
