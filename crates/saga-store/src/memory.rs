use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::store::{AppendOptions, SagaStore, validate_batch};
use crate::{Result, SagaId, SagaStoreError, StoredEvent, Version};

/// In-memory saga store for tests and single-process deployments.
#[derive(Clone, Default)]
pub struct InMemorySagaStore {
    logs: Arc<RwLock<HashMap<SagaId, Vec<StoredEvent>>>>,
}

impl InMemorySagaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the total number of events across all sagas.
    pub async fn event_count(&self) -> usize {
        self.logs.read().await.values().map(Vec::len).sum()
    }
}

#[async_trait]
impl SagaStore for InMemorySagaStore {
    async fn append(&self, events: Vec<StoredEvent>, options: AppendOptions) -> Result<Version> {
        validate_batch(&events)?;
        let saga_id = events[0].saga_id;

        let mut logs = self.logs.write().await;
        let log = logs.entry(saga_id).or_default();
        let current = log.last().map(|e| e.version).unwrap_or_default();

        if let Some(expected) = options.expected_version
            && expected != current
        {
            return Err(SagaStoreError::ConcurrencyConflict {
                saga_id,
                expected,
                actual: current,
            });
        }

        // Unique (saga_id, version) like the database constraint.
        if events[0].version <= current {
            return Err(SagaStoreError::ConcurrencyConflict {
                saga_id,
                expected: options.expected_version.unwrap_or(current),
                actual: current,
            });
        }

        let last = events.last().map(|e| e.version).unwrap_or(current);
        log.extend(events);
        Ok(last)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Vec<StoredEvent>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&saga_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn current_version(&self, saga_id: SagaId) -> Result<Option<Version>> {
        Ok(self
            .logs
            .read()
            .await
            .get(&saga_id)
            .and_then(|log| log.last())
            .map(|e| e.version))
    }

    async fn open_saga_ids(
        &self,
        saga_type: &str,
        terminal_event_types: &[&str],
    ) -> Result<Vec<SagaId>> {
        let logs = self.logs.read().await;
        let open: BTreeSet<SagaId> = logs
            .iter()
            .filter(|(_, log)| log.first().is_some_and(|e| e.saga_type == saga_type))
            .filter(|(_, log)| {
                !log.iter()
                    .any(|e| terminal_event_types.contains(&e.event_type.as_str()))
            })
            .map(|(id, _)| *id)
            .collect();
        Ok(open.into_iter().collect())
    }
}
