use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::SagaId;

/// Unique identifier for a stored saga event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Uuid);

impl EventId {
    /// Creates a new random event ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an event ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

/// Position of an event within one saga's log.
///
/// A saga that has never been written is at version 0; its first event is
/// version 1.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Version of a saga with no events.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Version of the first event.
    pub fn first() -> Self {
        Self(1)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A saga event as it sits in the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: EventId,

    /// The saga instance this event belongs to.
    pub saga_id: SagaId,

    /// The saga kind (e.g. "CreateUser", "CreateAvailability").
    pub saga_type: String,

    /// The event name (e.g. "CommandIssued").
    pub event_type: String,

    /// Version of the saga after this event.
    pub version: Version,

    pub recorded_at: DateTime<Utc>,

    /// The event body as JSON.
    pub payload: serde_json::Value,
}

impl StoredEvent {
    pub fn builder() -> StoredEventBuilder {
        StoredEventBuilder::default()
    }

    /// Decodes the payload into a typed event.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Builder for [`StoredEvent`].
#[derive(Debug, Default)]
pub struct StoredEventBuilder {
    saga_id: Option<SagaId>,
    saga_type: Option<String>,
    event_type: Option<String>,
    version: Option<Version>,
    recorded_at: Option<DateTime<Utc>>,
    payload: Option<serde_json::Value>,
}

impl StoredEventBuilder {
    pub fn saga_id(mut self, id: SagaId) -> Self {
        self.saga_id = Some(id);
        self
    }

    pub fn saga_type(mut self, saga_type: impl Into<String>) -> Self {
        self.saga_type = Some(saga_type.into());
        self
    }

    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn version(mut self, version: Version) -> Self {
        self.version = Some(version);
        self
    }

    /// Overrides the record time. Defaults to now.
    pub fn recorded_at(mut self, at: DateTime<Utc>) -> Self {
        self.recorded_at = Some(at);
        self
    }

    /// Serializes `payload` as the event body.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builds the event, returning None if a required field is missing.
    pub fn build(self) -> Option<StoredEvent> {
        Some(StoredEvent {
            event_id: EventId::new(),
            saga_id: self.saga_id?,
            saga_type: self.saga_type?,
            event_type: self.event_type?,
            version: self.version?,
            recorded_at: self.recorded_at.unwrap_or_else(Utc::now),
            payload: self.payload?,
        })
    }
}
