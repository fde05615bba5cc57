//! Core aggregate and domain event traits.

use common::SagaId;
use saga_store::Version;
use serde::{Serialize, de::DeserializeOwned};

/// A fact recorded in a saga's log, named in past tense.
pub trait DomainEvent: Serialize + DeserializeOwned + Send + Sync + Clone {
    /// The event type name stored next to the payload.
    fn event_type(&self) -> &'static str;
}

/// State rebuilt by replaying its events.
///
/// `apply` must be pure: the same state and event always produce the same
/// new state, and it never fails.
pub trait Aggregate: Send + Sync + Sized {
    type Event: DomainEvent;

    /// Saga type name under which the events are stored.
    fn aggregate_type(&self) -> &str;

    fn id(&self) -> SagaId;

    /// Version of the last applied event; 0 for nothing applied.
    fn version(&self) -> Version;

    fn set_version(&mut self, version: Version);

    fn apply(&mut self, event: Self::Event);

    fn apply_events(&mut self, events: impl IntoIterator<Item = Self::Event>) {
        for event in events {
            self.apply(event);
        }
    }
}
