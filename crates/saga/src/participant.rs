//! The participant side of a saga.
//!
//! A participant applies exactly one local effect per command and answers
//! with exactly one reply. [`ParticipantHandler`] wraps any [`Participant`]
//! with the delivery rules every service shares: routing, idempotency,
//! negative replies for local failures and publish retry.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bus::{
    Consumer, Envelope, HandlerError, MessageBus, MessageBusExt, RetryPolicy, publish_with_retry,
};
use domain::{Command, IdempotencyKey, MessageType, Reply, SagaSchema};
use tokio::sync::Mutex;

use crate::error::EffectError;

/// How a participant answers one command type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route<R> {
    pub success: R,
    /// For compensating commands this is the schema's `CompensationFailed`.
    pub failure: R,
    pub compensating: bool,
}

impl<R> Route<R> {
    pub fn forward(success: R, failure: R) -> Self {
        Self {
            success,
            failure,
            compensating: false,
        }
    }

    pub fn compensating(success: R, failure: R) -> Self {
        Self {
            success,
            failure,
            compensating: true,
        }
    }
}

/// A service contributing one or more steps to a saga.
#[async_trait]
pub trait Participant<S: SagaSchema>: Send + Sync {
    /// Consumer group name on the command topic.
    fn name(&self) -> &'static str;

    /// Returns None for commands this participant does not handle.
    fn route(&self, command: S::CommandType) -> Option<Route<S::ReplyType>>;

    /// Applies the local effect. `Some(entity)` replaces the payload of the
    /// success reply.
    async fn apply(
        &self,
        command: S::CommandType,
        entity: &S::Entity,
    ) -> Result<Option<S::Entity>, EffectError>;
}

/// Result of claiming an idempotency key.
#[derive(Debug, Clone, PartialEq)]
pub enum Claim<V> {
    /// First delivery; the caller applies the effect.
    Acquired,
    /// Another delivery of the same command is being processed.
    InProgress,
    /// Already applied; this is the recorded reply.
    Done(V),
}

/// Remembers which (entity, step) pairs a participant already applied.
#[async_trait]
pub trait IdempotencyStore<V: Clone + Send + Sync>: Send + Sync {
    async fn claim(&self, key: &IdempotencyKey) -> Claim<V>;

    async fn complete(&self, key: &IdempotencyKey, value: V);
}

#[derive(Debug, Clone)]
enum Slot<V> {
    InProgress,
    Done(V),
}

struct Slots<V> {
    slots: HashMap<IdempotencyKey, Slot<V>>,
    /// Completed keys, oldest first.
    done: VecDeque<IdempotencyKey>,
}

/// Keeps at most `capacity` completed records; the oldest are forgotten
/// first. Keys still in progress are never evicted.
pub struct InMemoryIdempotencyStore<V> {
    inner: Arc<Mutex<Slots<V>>>,
    capacity: usize,
}

impl<V> InMemoryIdempotencyStore<V> {
    pub const DEFAULT_CAPACITY: usize = 10_000;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Slots {
                slots: HashMap::new(),
                done: VecDeque::new(),
            })),
            capacity: capacity.max(1),
        }
    }

    /// Number of keys currently remembered, in progress or done.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<V> Default for InMemoryIdempotencyStore<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for InMemoryIdempotencyStore<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            capacity: self.capacity,
        }
    }
}

#[async_trait]
impl<V: Clone + Send + Sync + 'static> IdempotencyStore<V> for InMemoryIdempotencyStore<V> {
    async fn claim(&self, key: &IdempotencyKey) -> Claim<V> {
        let mut inner = self.inner.lock().await;
        match inner.slots.get(key) {
            Some(Slot::Done(v)) => Claim::Done(v.clone()),
            Some(Slot::InProgress) => Claim::InProgress,
            None => {
                inner.slots.insert(key.clone(), Slot::InProgress);
                Claim::Acquired
            }
        }
    }

    async fn complete(&self, key: &IdempotencyKey, value: V) {
        let mut inner = self.inner.lock().await;
        let previous = inner.slots.insert(key.clone(), Slot::Done(value));
        if !matches!(previous, Some(Slot::Done(_))) {
            inner.done.push_back(key.clone());
        }
        while inner.done.len() > self.capacity {
            if let Some(oldest) = inner.done.pop_front() {
                inner.slots.remove(&oldest);
                tracing::trace!(key = %oldest, "idempotency record evicted");
            }
        }
    }
}

/// Subscribes a [`Participant`] to its saga's command topic.
pub struct ParticipantHandler<S: SagaSchema, B> {
    participant: Arc<dyn Participant<S>>,
    bus: Arc<B>,
    idempotency: Arc<dyn IdempotencyStore<Reply<S>>>,
    retry: RetryPolicy,
}

impl<S, B> ParticipantHandler<S, B>
where
    S: SagaSchema,
    B: MessageBus + 'static,
{
    pub fn new(participant: Arc<dyn Participant<S>>, bus: Arc<B>, retry: RetryPolicy) -> Self {
        Self {
            participant,
            bus,
            idempotency: Arc::new(InMemoryIdempotencyStore::new()),
            retry,
        }
    }

    pub fn with_idempotency(mut self, store: Arc<dyn IdempotencyStore<Reply<S>>>) -> Self {
        self.idempotency = store;
        self
    }

    /// Registers the handler under the participant's consumer group.
    pub async fn subscribe(self) -> bus::Result<()> {
        let bus = self.bus.clone();
        let group = self.participant.name();
        bus.subscribe_typed::<Command<S>, _>(group, Arc::new(self))
            .await
    }

    async fn run(
        &self,
        command: &Command<S>,
        route: Route<S::ReplyType>,
    ) -> Reply<S> {
        match self
            .participant
            .apply(command.kind, &command.payload)
            .await
        {
            Ok(enriched) => {
                let payload = enriched.unwrap_or_else(|| command.payload.clone());
                command.reply(route.success, payload)
            }
            Err(e) => {
                tracing::warn!(
                    participant = self.participant.name(),
                    command = %command.kind,
                    entity_id = %command.entity_id(),
                    compensating = route.compensating,
                    error = %e,
                    "local effect failed"
                );
                command
                    .reply(route.failure, command.payload.clone())
                    .with_reason(e.to_string())
            }
        }
    }
}

#[async_trait]
impl<S, B> Consumer<Command<S>> for ParticipantHandler<S, B>
where
    S: SagaSchema,
    B: MessageBus + 'static,
{
    #[tracing::instrument(
        skip(self, command),
        fields(
            participant = self.participant.name(),
            saga_id = %command.saga_id(),
            command = %command.kind,
        )
    )]
    async fn consume(&self, command: Command<S>) -> Result<(), HandlerError> {
        let name = self.participant.name();
        let Some(route) = self.participant.route(command.kind) else {
            tracing::debug!("command not routed to this participant");
            if command.kind.is_unknown() {
                metrics::counter!("participant_unknown_commands_total", "participant" => name)
                    .increment(1);
            }
            return Ok(());
        };

        let key = command.idempotency_key();
        let reply = match self.idempotency.claim(&key).await {
            Claim::Done(recorded) => {
                tracing::debug!(%key, "already applied, replaying recorded reply");
                let mut reply = command.reply(recorded.kind, recorded.payload);
                reply.reason = recorded.reason;
                reply
            }
            Claim::InProgress => {
                return Err(HandlerError::retry(format!("{key} is being applied")));
            }
            Claim::Acquired => {
                let reply = self.run(&command, route).await;
                self.idempotency.complete(&key, reply.clone()).await;
                reply
            }
        };

        metrics::counter!(
            "participant_replies_total",
            "participant" => name,
            "reply" => reply.kind.as_str()
        )
        .increment(1);

        let envelope = Envelope::encode(&reply)?;
        publish_with_retry(self.bus.as_ref(), S::REPLY_TOPIC, envelope, &self.retry).await?;
        tracing::debug!(reply = %reply.kind, "reply published");
        Ok(())
    }
}
