//! Envelopes carried by the bus and the typed messages inside them.
//!
//! Payloads are JSON so every transport can carry them unchanged.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{BusError, HandlerError};

/// A typed payload bound to one topic.
pub trait Message: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TOPIC: &'static str;

    /// Rejects payloads that decoded but cannot be processed.
    fn validate(&self) -> std::result::Result<(), String> {
        Ok(())
    }
}

/// What travels on the bus: a JSON payload plus delivery metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: Uuid,
    pub topic: String,
    pub payload: serde_json::Value,
    pub published_at: DateTime<Utc>,
    /// Delivery attempt, starting at 1. Set by the bus, not the publisher.
    #[serde(default)]
    pub delivery: u32,
}

impl Envelope {
    /// Wraps `payload` for `topic` with a fresh id and the current time.
    pub fn new(topic: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
            delivery: 0,
        }
    }

    /// Serializes `message` into an envelope for its topic.
    pub fn encode<M: Message>(message: &M) -> Result<Self, BusError> {
        Ok(Self::new(M::TOPIC, serde_json::to_value(message)?))
    }

    /// Deserializes and validates the payload. Both failures are permanent.
    pub fn decode<M: Message>(&self) -> Result<M, HandlerError> {
        let message: M = serde_json::from_value(self.payload.clone())
            .map_err(|e| HandlerError::Malformed(format!("{}: {e}", self.topic)))?;
        message.validate().map_err(HandlerError::Malformed)?;
        Ok(message)
    }

    pub fn is_redelivery(&self) -> bool {
        self.delivery > 1
    }
}
