//! Message bus adapter.
//!
//! Sagas talk to their participants only through [`MessageBus`]: publishers
//! hand over an [`Envelope`] for a topic, subscribers receive it at least once
//! and ack or nack each delivery. [`InMemoryBus`] is the in-process transport
//! used by tests and single-process deployments; [`NatsBus`] runs the same
//! contract over NATS JetStream for participants in separate processes.

pub mod bus;
pub mod config;
pub mod envelope;
pub mod error;
pub mod memory;
pub mod nats;
pub mod retry;

pub use bus::{Consumer, MessageBus, MessageBusExt, MessageHandler, TypedHandler};
pub use envelope::{Envelope, Message};
pub use error::{BusError, HandlerError, Result};
pub use config::BusConfig;
pub use memory::{DeadLetter, InMemoryBus};
pub use nats::NatsBus;
pub use retry::{RetryPolicy, publish_with_retry};
