//! Saga error types.

use bus::BusError;
use common::{EntityId, SagaId};
use domain::ValidationError;
use saga_store::SagaStoreError;
use thiserror::Error;

/// Errors that can occur while driving sagas.
#[derive(Debug, Error)]
pub enum SagaError {
    /// The entity was rejected before a saga was created.
    #[error("Invalid entity: {0}")]
    Validation(#[from] ValidationError),

    #[error("Saga not found: {0}")]
    NotFound(SagaId),

    /// The log holds a value this definition does not know.
    #[error("Corrupt saga log for {saga_id}: {reason}")]
    CorruptLog { saga_id: SagaId, reason: String },

    /// Every retry of a transition lost the optimistic-concurrency race.
    #[error("Saga {saga_id} still conflicting after {attempts} attempts")]
    Contended { saga_id: SagaId, attempts: u32 },

    #[error("Saga store error: {0}")]
    Store(#[from] SagaStoreError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    pub fn corrupt(saga_id: SagaId, reason: impl Into<String>) -> Self {
        SagaError::CorruptLog {
            saga_id,
            reason: reason.into(),
        }
    }

    pub(crate) fn is_conflict(&self) -> bool {
        matches!(self, SagaError::Store(e) if e.is_conflict())
    }
}

/// A participant's local effect could not be applied.
///
/// Never crosses the bus: the participant turns it into a negative reply.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    /// The service refused the change.
    #[error("{0}")]
    Rejected(String),

    /// A cancellation was recorded for this entity and step earlier.
    #[error("{step} for {entity_id} was cancelled")]
    Cancelled { entity_id: EntityId, step: String },

    /// A uniqueness rule of the local store was violated.
    #[error("{0} already exists")]
    Duplicate(String),
}

impl EffectError {
    pub fn rejected(reason: impl Into<String>) -> Self {
        EffectError::Rejected(reason.into())
    }

    pub fn cancelled(entity_id: &EntityId, step: impl Into<String>) -> Self {
        EffectError::Cancelled {
            entity_id: entity_id.clone(),
            step: step.into(),
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
