//! NATS JetStream transport.
//!
//! Each topic gets an interest-retention stream; each consumer group gets a
//! durable pull consumer on it, so a group resumes where it left off after a
//! restart and every group sees each message once. A nack becomes a JetStream
//! `Nak` with the backoff of the configured redelivery policy; exhausted and
//! malformed deliveries are terminated and counted as dead letters.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, AckKind};
use async_nats::jetstream::consumer::pull::Config as PullConsumerConfig;
use async_nats::jetstream::consumer::{AckPolicy, DeliverPolicy, PullConsumer};
use async_nats::jetstream::stream::{Config as StreamConfig, RetentionPolicy, StorageType};
use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::bus::{MessageBus, MessageHandler};
use crate::config::BusConfig;
use crate::envelope::Envelope;
use crate::error::{BusError, HandlerError, Result};
use crate::retry::RetryPolicy;

const STREAM_PREFIX: &str = "SAGA";
/// How long the server waits for an ack before redelivering on its own.
const ACK_WAIT: Duration = Duration::from_secs(30);
const MAX_STREAM_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

fn unavailable(err: impl std::fmt::Display) -> BusError {
    BusError::Unavailable(err.to_string())
}

/// Stream holding one topic, e.g. `create_user.reply` -> `SAGA_CREATE_USER_REPLY`.
fn stream_name(topic: &str) -> String {
    format!("{STREAM_PREFIX}_{}", sanitize(topic).to_uppercase())
}

/// Durable consumer for one group on one topic.
fn consumer_name(topic: &str, group: &str) -> String {
    format!("{}--{}", sanitize(group), sanitize(topic))
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// What to tell the server about one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Verdict {
    Ack,
    Redeliver(Duration),
    DeadLetter(String),
}

fn verdict(
    result: std::result::Result<(), HandlerError>,
    delivery: u32,
    policy: &RetryPolicy,
) -> Verdict {
    match result {
        Ok(()) => Verdict::Ack,
        Err(HandlerError::Malformed(reason)) => Verdict::DeadLetter(reason),
        Err(HandlerError::Retry(_)) if delivery < policy.max_attempts => {
            Verdict::Redeliver(policy.delay_after(delivery))
        }
        Err(HandlerError::Retry(reason)) => Verdict::DeadLetter(reason),
    }
}

/// Bus backed by a NATS server with JetStream enabled.
#[derive(Clone)]
pub struct NatsBus {
    jetstream: jetstream::Context,
    policy: RetryPolicy,
    /// Streams known to exist.
    streams: Arc<Mutex<HashSet<String>>>,
    consumers: Arc<std::sync::Mutex<Vec<JoinHandle<()>>>>,
}

impl NatsBus {
    /// Connects to the server named by `config.url` (`nats://host:port`).
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        if !config.is_nats() {
            return Err(BusError::InvalidUrl(config.url.clone()));
        }
        let client = async_nats::connect(config.url.as_str())
            .await
            .map_err(unavailable)?;
        tracing::info!(url = %config.url, "connected to NATS");
        Ok(Self {
            jetstream: jetstream::new(client),
            policy: config.redelivery_policy(),
            streams: Arc::new(Mutex::new(HashSet::new())),
            consumers: Arc::new(std::sync::Mutex::new(Vec::new())),
        })
    }

    async fn ensure_stream(&self, topic: &str) -> Result<jetstream::stream::Stream> {
        let name = stream_name(topic);
        let stream = self
            .jetstream
            .get_or_create_stream(StreamConfig {
                name: name.clone(),
                subjects: vec![topic.to_string()],
                retention: RetentionPolicy::Interest,
                storage: StorageType::File,
                max_age: MAX_STREAM_AGE,
                ..Default::default()
            })
            .await
            .map_err(unavailable)?;
        if self.streams.lock().await.insert(name.clone()) {
            tracing::debug!(topic, stream = %name, "stream ready");
        }
        Ok(stream)
    }

    async fn consumer(&self, topic: &str, group: &str) -> Result<PullConsumer> {
        let stream = self.ensure_stream(topic).await?;
        let name = consumer_name(topic, group);
        stream
            .get_or_create_consumer(
                &name,
                PullConsumerConfig {
                    durable_name: Some(name.clone()),
                    deliver_policy: DeliverPolicy::New,
                    ack_policy: AckPolicy::Explicit,
                    ack_wait: ACK_WAIT,
                    max_deliver: i64::from(self.policy.max_attempts),
                    ..Default::default()
                },
            )
            .await
            .map_err(unavailable)
    }

    /// Stops every consumer loop started by this bus.
    pub fn shutdown(&self) {
        let consumers = std::mem::take(
            &mut *self
                .consumers
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        );
        for consumer in consumers {
            consumer.abort();
        }
    }
}

async fn deliver(
    message: jetstream::Message,
    topic: String,
    group: String,
    handler: Arc<dyn MessageHandler>,
    policy: RetryPolicy,
) {
    let delivery = message
        .info()
        .map(|info| u32::try_from(info.delivered).unwrap_or(u32::MAX))
        .unwrap_or(1);

    let result = match serde_json::from_slice::<Envelope>(&message.payload) {
        Ok(mut envelope) => {
            envelope.topic = topic.clone();
            envelope.delivery = delivery;
            handler.handle(&envelope).await
        }
        Err(e) => Err(HandlerError::Malformed(format!("{topic}: {e}"))),
    };

    let ack = match verdict(result, delivery, &policy) {
        Verdict::Ack => message.ack().await,
        Verdict::Redeliver(delay) => {
            tracing::debug!(%topic, %group, delivery, ?delay, "delivery nacked, redelivering");
            metrics::counter!("bus_redeliveries_total", "topic" => topic.clone()).increment(1);
            message.ack_with(AckKind::Nak(Some(delay))).await
        }
        Verdict::DeadLetter(reason) => {
            tracing::error!(%topic, %group, delivery, %reason, "message dead-lettered");
            metrics::counter!("bus_dead_letters_total", "topic" => topic.clone()).increment(1);
            message.ack_with(AckKind::Term).await
        }
    };
    if let Err(e) = ack {
        // The server redelivers after `ACK_WAIT`.
        tracing::warn!(%topic, %group, error = %e, "could not ack delivery");
    }
}

#[async_trait]
impl MessageBus for NatsBus {
    async fn publish(&self, topic: &str, mut envelope: Envelope) -> Result<()> {
        if !self.streams.lock().await.contains(&stream_name(topic)) {
            self.ensure_stream(topic).await?;
        }
        envelope.topic = topic.to_string();
        let payload = serde_json::to_vec(&envelope)?;
        let ack = self
            .jetstream
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(unavailable)?;
        ack.await.map_err(unavailable)?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        let consumer = self.consumer(topic, group).await?;
        let mut messages = consumer.messages().await.map_err(unavailable)?;
        let (topic, group) = (topic.to_string(), group.to_string());
        let policy = self.policy;
        tracing::debug!(%topic, %group, "subscribed");

        let task = tokio::spawn(async move {
            while let Some(next) = messages.next().await {
                match next {
                    Ok(message) => {
                        tokio::spawn(deliver(
                            message,
                            topic.clone(),
                            group.clone(),
                            handler.clone(),
                            policy,
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(%topic, %group, error = %e, "error pulling messages");
                    }
                }
            }
            tracing::info!(%topic, %group, "consumer stopped");
        });
        self.consumers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(task);
        Ok(())
    }
}
