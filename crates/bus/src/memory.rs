//! In-process bus.
//!
//! Deliveries run as tokio tasks in the publishing process. Nothing survives
//! a restart; the saga log and `recover` cover that.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::bus::{MessageBus, MessageHandler};
use crate::config::BusConfig;
use crate::envelope::Envelope;
use crate::error::{BusError, HandlerError, Result};
use crate::retry::RetryPolicy;

/// A message that exhausted its deliveries or could not be decoded.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub envelope: Envelope,
    pub group: String,
    pub reason: String,
}

struct Group {
    name: String,
    members: Vec<Arc<dyn MessageHandler>>,
    next: usize,
}

impl Group {
    fn pick(&mut self) -> Arc<dyn MessageHandler> {
        let handler = self.members[self.next % self.members.len()].clone();
        self.next = self.next.wrapping_add(1);
        handler
    }
}

#[derive(Default)]
struct BusState {
    topics: HashMap<String, Vec<Group>>,
    /// Only filled when `record_published` is set.
    published: Vec<Envelope>,
    dead_letters: VecDeque<DeadLetter>,
}

struct Shared {
    state: Mutex<BusState>,
    available: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    policy: RetryPolicy,
    record_published: bool,
    max_dead_letters: usize,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, BusState> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish_delivery(&self) {
        if self.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.idle.notify_waiters();
        }
    }
}

/// In-process bus for tests and single-process deployments.
///
/// Every delivery runs on its own task, so handlers execute concurrently.
/// Nacked deliveries come back after exponential backoff until
/// `max_deliveries` is reached, then land in [`InMemoryBus::dead_letters`],
/// which keeps the most recent `max_dead_letters`.
#[derive(Clone)]
pub struct InMemoryBus {
    shared: Arc<Shared>,
}

impl InMemoryBus {
    /// Opens the transport named by `config.url`.
    pub async fn connect(config: &BusConfig) -> Result<Self> {
        let Some(name) = config.url.strip_prefix("memory://") else {
            return Err(BusError::InvalidUrl(config.url.clone()));
        };
        if name.is_empty() {
            return Err(BusError::InvalidUrl(config.url.clone()));
        }
        tracing::info!(
            url = %config.url,
            record = config.record_published,
            "connected to in-memory bus"
        );
        Ok(Self::from_config(config))
    }

    /// A bus with default settings.
    pub fn new() -> Self {
        Self::from_config(&BusConfig::default())
    }

    fn from_config(config: &BusConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BusState::default()),
                available: AtomicBool::new(true),
                in_flight: AtomicUsize::new(0),
                idle: Notify::new(),
                policy: config.redelivery_policy(),
                record_published: config.record_published,
                max_dead_letters: config.max_dead_letters,
            }),
        }
    }

    /// Simulates the transport going down (`false`) or coming back.
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
    }

    /// Every envelope accepted by `publish`, in order. Empty unless the bus
    /// was built with `record_published`.
    pub fn published(&self) -> Vec<Envelope> {
        self.shared.state().published.clone()
    }

    /// Envelopes accepted on `topic`, in order.
    pub fn published_on(&self, topic: &str) -> Vec<Envelope> {
        self.shared
            .state()
            .published
            .iter()
            .filter(|e| e.topic == topic)
            .cloned()
            .collect()
    }

    /// The most recent dead letters, oldest first.
    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.shared.state().dead_letters.iter().cloned().collect()
    }

    /// Number of deliveries currently running or waiting for redelivery.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::Acquire)
    }

    /// Resolves once no delivery is running or pending redelivery.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.in_flight() == 0 {
                return;
            }
            notified.await;
        }
    }

    fn spawn_delivery(&self, group: String, handler: Arc<dyn MessageHandler>, envelope: Envelope) {
        self.shared.in_flight.fetch_add(1, Ordering::AcqRel);
        let shared = self.shared.clone();
        tokio::spawn(async move {
            deliver(&shared, &group, handler, envelope).await;
            shared.finish_delivery();
        });
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn deliver(
    shared: &Shared,
    group: &str,
    handler: Arc<dyn MessageHandler>,
    mut envelope: Envelope,
) {
    let max = shared.policy.max_attempts;
    for delivery in 1..=max {
        envelope.delivery = delivery;
        match handler.handle(&envelope).await {
            Ok(()) => return,
            Err(HandlerError::Malformed(reason)) => {
                dead_letter(shared, group, envelope, reason);
                return;
            }
            Err(HandlerError::Retry(reason)) if delivery < max => {
                let delay = shared.policy.delay_after(delivery);
                tracing::debug!(
                    topic = %envelope.topic,
                    group,
                    delivery,
                    ?delay,
                    %reason,
                    "delivery nacked, redelivering"
                );
                metrics::counter!("bus_redeliveries_total", "topic" => envelope.topic.clone())
                    .increment(1);
                tokio::time::sleep(delay).await;
            }
            Err(HandlerError::Retry(reason)) => {
                dead_letter(shared, group, envelope, reason);
                return;
            }
        }
    }
}

fn dead_letter(shared: &Shared, group: &str, envelope: Envelope, reason: String) {
    tracing::error!(
        topic = %envelope.topic,
        message_id = %envelope.id,
        group,
        delivery = envelope.delivery,
        %reason,
        "message dead-lettered"
    );
    metrics::counter!("bus_dead_letters_total", "topic" => envelope.topic.clone()).increment(1);
    if shared.max_dead_letters == 0 {
        return;
    }
    let mut state = shared.state();
    if state.dead_letters.len() >= shared.max_dead_letters {
        state.dead_letters.pop_front();
    }
    state.dead_letters.push_back(DeadLetter {
        envelope,
        group: group.to_string(),
        reason,
    });
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn publish(&self, topic: &str, mut envelope: Envelope) -> Result<()> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable(format!("cannot publish to {topic}")));
        }
        envelope.topic = topic.to_string();

        let targets: Vec<(String, Arc<dyn MessageHandler>)> = {
            let mut state = self.shared.state();
            if self.shared.record_published {
                state.published.push(envelope.clone());
            }
            state
                .topics
                .get_mut(topic)
                .map(|groups| {
                    groups
                        .iter_mut()
                        .map(|g| (g.name.clone(), g.pick()))
                        .collect()
                })
                .unwrap_or_default()
        };

        if targets.is_empty() {
            tracing::debug!(topic, "no subscribers, message dropped");
        }
        for (group, handler) in targets {
            self.spawn_delivery(group, handler, envelope.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        group: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(BusError::Unavailable(format!("cannot subscribe to {topic}")));
        }
        let mut state = self.shared.state();
        let groups = state.topics.entry(topic.to_string()).or_default();
        match groups.iter_mut().find(|g| g.name == group) {
            Some(existing) => existing.members.push(handler),
            None => groups.push(Group {
                name: group.to_string(),
                members: vec![handler],
                next: 0,
            }),
        }
        tracing::debug!(topic, group, "subscribed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    struct Counting {
        calls: AtomicU32,
        fail_first: u32,
    }

    #[async_trait]
    impl MessageHandler for Counting {
        async fn handle(&self, _envelope: &Envelope) -> std::result::Result<(), HandlerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                return Err(HandlerError::retry("not yet"));
            }
            Ok(())
        }
    }

    fn fast_config(max_deliveries: u32) -> BusConfig {
        BusConfig::in_memory()
            .with_max_deliveries(max_deliveries)
            .with_redelivery_base(Duration::from_millis(1))
            .with_recording(true)
    }

    fn fast_bus(max_deliveries: u32) -> InMemoryBus {
        InMemoryBus::from_config(&fast_config(max_deliveries))
    }

    #[tokio::test]
    async fn connect_rejects_foreign_url() {
        let config = BusConfig::in_memory().with_url("nats://localhost:4222");
        assert!(matches!(
            InMemoryBus::connect(&config).await,
            Err(BusError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn nacked_delivery_is_redelivered() {
        let bus = fast_bus(5);
        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: 2,
        });
        bus.subscribe("t", "g", handler.clone()).await.unwrap();

        bus.publish("t", Envelope::new("t", serde_json::json!({})))
            .await
            .unwrap();
        bus.wait_idle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(bus.dead_letters().is_empty());
    }

    #[tokio::test]
    async fn exhausted_delivery_is_dead_lettered() {
        let bus = fast_bus(3);
        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        bus.subscribe("t", "g", handler.clone()).await.unwrap();

        bus.publish("t", Envelope::new("t", serde_json::json!({})))
            .await
            .unwrap();
        bus.wait_idle().await;

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].envelope.delivery, 3);
        assert_eq!(dead[0].group, "g");
    }

    #[tokio::test]
    async fn groups_each_get_one_copy() {
        let bus = fast_bus(1);
        let a1 = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let a2 = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        let b = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: 0,
        });
        bus.subscribe("t", "a", a1.clone()).await.unwrap();
        bus.subscribe("t", "a", a2.clone()).await.unwrap();
        bus.subscribe("t", "b", b.clone()).await.unwrap();

        for _ in 0..4 {
            bus.publish("t", Envelope::new("t", serde_json::json!({})))
                .await
                .unwrap();
        }
        bus.wait_idle().await;

        assert_eq!(a1.calls.load(Ordering::SeqCst), 2);
        assert_eq!(a2.calls.load(Ordering::SeqCst), 2);
        assert_eq!(b.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn unavailable_bus_refuses_publish() {
        let bus = fast_bus(1);
        bus.set_available(false);
        let err = bus
            .publish("t", Envelope::new("t", serde_json::json!({})))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn publish_log_is_off_unless_requested() {
        let bus = InMemoryBus::from_config(&BusConfig::in_memory());
        bus.publish("t", Envelope::new("t", serde_json::json!({})))
            .await
            .unwrap();
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn dead_letters_keep_only_the_most_recent() {
        let bus = InMemoryBus::from_config(&fast_config(1).with_max_dead_letters(2));
        let handler = Arc::new(Counting {
            calls: AtomicU32::new(0),
            fail_first: u32::MAX,
        });
        bus.subscribe("t", "g", handler).await.unwrap();

        for n in 0..3 {
            bus.publish("t", Envelope::new("t", serde_json::json!({ "n": n })))
                .await
                .unwrap();
            bus.wait_idle().await;
        }

        let dead = bus.dead_letters();
        assert_eq!(dead.len(), 2);
        assert_eq!(dead[0].envelope.payload["n"], 1);
        assert_eq!(dead[1].envelope.payload["n"], 2);
    }
}
