//! NATS JetStream integration tests
//!
//! These tests share one NATS container and need Docker. Run with:
//!
//! ```bash
//! cargo test -p bus --test nats_integration -- --ignored
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bus::{BusConfig, Envelope, HandlerError, MessageBus, MessageHandler, NatsBus};
use serial_test::serial;
use testcontainers::core::{IntoContainerPort, WaitFor};
use testcontainers::runners::AsyncRunner;
use testcontainers::{ContainerAsync, GenericImage, ImageExt};
use tokio::sync::OnceCell;
use uuid::Uuid;

struct ContainerInfo {
    #[allow(dead_code)] // Container must stay alive for tests
    container: ContainerAsync<GenericImage>,
    url: String,
}

static CONTAINER: OnceCell<Arc<ContainerInfo>> = OnceCell::const_new();

async fn get_container_info() -> Arc<ContainerInfo> {
    CONTAINER
        .get_or_init(|| async {
            let container = GenericImage::new("nats", "2.10-alpine")
                .with_exposed_port(4222.tcp())
                .with_wait_for(WaitFor::message_on_stderr("Server is ready"))
                .with_cmd(["-js"])
                .start()
                .await
                .unwrap();
            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(4222).await.unwrap();

            Arc::new(ContainerInfo {
                container,
                url: format!("nats://{host}:{port}"),
            })
        })
        .await
        .clone()
}

async fn get_test_bus(max_deliveries: u32) -> NatsBus {
    let info = get_container_info().await;
    let config = BusConfig::in_memory()
        .with_url(info.url.clone())
        .with_max_deliveries(max_deliveries)
        .with_redelivery_base(Duration::from_millis(10));
    NatsBus::connect(&config).await.unwrap()
}

/// Each test gets its own topic so streams never carry over.
fn topic() -> String {
    format!("test.{}", Uuid::new_v4().simple())
}

/// Records the delivery number of every envelope; fails the first
/// `failures` of them.
struct Recorder {
    deliveries: Mutex<Vec<u32>>,
    failures: usize,
}

impl Recorder {
    fn new(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
            failures,
        })
    }

    fn deliveries(&self) -> Vec<u32> {
        self.deliveries.lock().unwrap().clone()
    }

    async fn wait_for(&self, count: usize) -> Vec<u32> {
        for _ in 0..100 {
            if self.deliveries().len() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.deliveries()
    }
}

#[async_trait]
impl MessageHandler for Recorder {
    async fn handle(&self, envelope: &Envelope) -> Result<(), HandlerError> {
        let mut deliveries = self.deliveries.lock().unwrap();
        deliveries.push(envelope.delivery);
        if deliveries.len() <= self.failures {
            return Err(HandlerError::retry("not yet"));
        }
        Ok(())
    }
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_published_message_reaches_subscriber() {
    let bus = get_test_bus(3).await;
    let topic = topic();
    let recorder = Recorder::new(0);
    bus.subscribe(&topic, "workers", recorder.clone())
        .await
        .unwrap();

    bus.publish(&topic, Envelope::new(&topic, serde_json::json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(recorder.wait_for(1).await, vec![1]);
    bus.shutdown();
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_nacked_delivery_is_redelivered() {
    let bus = get_test_bus(3).await;
    let topic = topic();
    let recorder = Recorder::new(1);
    bus.subscribe(&topic, "workers", recorder.clone())
        .await
        .unwrap();

    bus.publish(&topic, Envelope::new(&topic, serde_json::json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(recorder.wait_for(2).await, vec![1, 2]);
    bus.shutdown();
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_exhausted_delivery_stops_redelivering() {
    let bus = get_test_bus(2).await;
    let topic = topic();
    let recorder = Recorder::new(usize::MAX);
    bus.subscribe(&topic, "workers", recorder.clone())
        .await
        .unwrap();

    bus.publish(&topic, Envelope::new(&topic, serde_json::json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(recorder.wait_for(2).await, vec![1, 2]);
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(recorder.deliveries(), vec![1, 2]);
    bus.shutdown();
}

#[tokio::test]
#[serial]
#[ignore = "requires docker"]
async fn test_every_group_sees_each_message() {
    let bus = get_test_bus(3).await;
    let topic = topic();
    let orchestrator = Recorder::new(0);
    let audit = Recorder::new(0);
    bus.subscribe(&topic, "orchestrator", orchestrator.clone())
        .await
        .unwrap();
    bus.subscribe(&topic, "audit", audit.clone()).await.unwrap();

    bus.publish(&topic, Envelope::new(&topic, serde_json::json!({"n": 1})))
        .await
        .unwrap();

    assert_eq!(orchestrator.wait_for(1).await, vec![1]);
    assert_eq!(audit.wait_for(1).await, vec![1]);
    bus.shutdown();
}
