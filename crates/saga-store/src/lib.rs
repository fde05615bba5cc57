//! Persisted saga log.
//!
//! Every saga instance is stored as an append-only sequence of events keyed by
//! its [`SagaId`]. Appends carry an expected [`Version`], which turns each
//! orchestrator transition into a read-modify-write: two deliveries racing on
//! the same instance cannot both win.

pub mod error;
pub mod event;
pub mod memory;
pub mod postgres;
pub mod store;

pub use common::SagaId;
pub use error::{Result, SagaStoreError};
pub use event::{EventId, StoredEvent, StoredEventBuilder, Version};
pub use memory::InMemorySagaStore;
pub use postgres::PostgresSagaStore;
pub use store::{AppendOptions, SagaStore, SagaStoreExt};
