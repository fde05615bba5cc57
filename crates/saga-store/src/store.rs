use async_trait::async_trait;

use crate::{Result, SagaId, SagaStoreError, StoredEvent, Version};

/// Options for appending events to a saga's log.
#[derive(Debug, Clone, Default)]
pub struct AppendOptions {
    /// Version the caller loaded. If None, no version check is performed.
    pub expected_version: Option<Version>,
}

impl AppendOptions {
    /// Appends without a version check.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends only if the saga is still at `version`.
    pub fn expect_version(version: Version) -> Self {
        Self {
            expected_version: Some(version),
        }
    }

    /// Appends only if the saga has no events yet.
    pub fn expect_new() -> Self {
        Self {
            expected_version: Some(Version::initial()),
        }
    }
}

/// Storage for saga logs.
///
/// Implementations must be thread-safe; the orchestrator shares one store
/// across every concurrent reply delivery.
#[async_trait]
pub trait SagaStore: Send + Sync {
    /// Appends events to one saga's log atomically.
    ///
    /// Fails with `ConcurrencyConflict` if `options.expected_version` is set
    /// and does not match the saga's current version. Returns the new version.
    async fn append(&self, events: Vec<StoredEvent>, options: AppendOptions) -> Result<Version>;

    /// Returns all events of a saga in version order.
    async fn load(&self, saga_id: SagaId) -> Result<Vec<StoredEvent>>;

    /// Returns the current version of a saga, or None if it has no events.
    async fn current_version(&self, saga_id: SagaId) -> Result<Option<Version>>;

    /// Returns the ids of sagas of `saga_type` that have no event whose type is
    /// listed in `terminal_event_types`.
    async fn open_saga_ids(
        &self,
        saga_type: &str,
        terminal_event_types: &[&str],
    ) -> Result<Vec<SagaId>>;
}

/// Convenience methods available on every [`SagaStore`].
#[async_trait]
pub trait SagaStoreExt: SagaStore {
    /// Appends a single event.
    async fn append_event(&self, event: StoredEvent, options: AppendOptions) -> Result<Version> {
        self.append(vec![event], options).await
    }

    /// Returns true if the saga has at least one event.
    async fn exists(&self, saga_id: SagaId) -> Result<bool> {
        Ok(self.current_version(saga_id).await?.is_some())
    }
}

impl<T: SagaStore + ?Sized> SagaStoreExt for T {}

/// Checks that a batch targets one saga with consecutive versions.
pub(crate) fn validate_batch(events: &[StoredEvent]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(SagaStoreError::InvalidAppend(
            "cannot append an empty batch".to_string(),
        ));
    };

    let mut expected = first.version;
    for event in events.iter().skip(1) {
        if event.saga_id != first.saga_id {
            return Err(SagaStoreError::InvalidAppend(
                "all events must belong to the same saga".to_string(),
            ));
        }
        expected = expected.next();
        if event.version != expected {
            return Err(SagaStoreError::InvalidAppend(format!(
                "versions must be sequential: expected {expected}, got {}",
                event.version
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(saga_id: SagaId, version: i64) -> StoredEvent {
        StoredEvent::builder()
            .saga_id(saga_id)
            .saga_type("CreateUser")
            .event_type("Test")
            .version(Version::new(version))
            .payload_raw(serde_json::json!({}))
            .build()
            .unwrap()
    }

    #[test]
    fn empty_batch_is_rejected() {
        assert!(matches!(
            validate_batch(&[]),
            Err(SagaStoreError::InvalidAppend(_))
        ));
    }

    #[test]
    fn mixed_sagas_are_rejected() {
        let batch = vec![event(SagaId::new(), 1), event(SagaId::new(), 2)];
        assert!(validate_batch(&batch).is_err());
    }

    #[test]
    fn gaps_are_rejected() {
        let id = SagaId::new();
        assert!(validate_batch(&[event(id, 1), event(id, 3)]).is_err());
        assert!(validate_batch(&[event(id, 1), event(id, 2)]).is_ok());
    }
}
