//! Error types for the bus.

use thiserror::Error;

/// Errors raised by the transport itself.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport is down or could not be reached.
    #[error("Bus unavailable: {0}")]
    Unavailable(String),

    #[error("Unsupported bus URL: {0}")]
    InvalidUrl(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl BusError {
    /// True for failures that may clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(self, BusError::Unavailable(_))
    }
}

/// Outcome of a handler that did not ack its delivery.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The payload can never be processed; it is dead-lettered at once.
    #[error("Malformed message: {0}")]
    Malformed(String),

    /// Processing failed for now; the delivery is nacked and redelivered.
    #[error("Retry later: {0}")]
    Retry(String),
}

impl HandlerError {
    /// Asks for a redelivery, keeping `reason` for the logs.
    pub fn retry(reason: impl std::fmt::Display) -> Self {
        HandlerError::Retry(reason.to_string())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, HandlerError::Malformed(_))
    }
}

impl From<BusError> for HandlerError {
    fn from(err: BusError) -> Self {
        HandlerError::Retry(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, BusError>;
