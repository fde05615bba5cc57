use thiserror::Error;

use crate::{SagaId, Version};

/// Errors that can occur when reading or writing the saga log.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// Another writer appended to the saga since it was loaded.
    #[error(
        "Concurrency conflict for saga {saga_id}: expected version {expected}, found {actual}"
    )]
    ConcurrencyConflict {
        saga_id: SagaId,
        expected: Version,
        actual: Version,
    },

    /// The batch handed to `append` is malformed.
    #[error("Invalid append: {0}")]
    InvalidAppend(String),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaStoreError {
    /// Returns true if the error is an optimistic concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, SagaStoreError::ConcurrencyConflict { .. })
    }
}

/// Result type for saga store operations.
pub type Result<T> = std::result::Result<T, SagaStoreError>;
