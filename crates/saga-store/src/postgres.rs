use async_trait::async_trait;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::store::{AppendOptions, SagaStore, validate_batch};
use crate::{EventId, Result, SagaId, SagaStoreError, StoredEvent, Version};

/// PostgreSQL-backed saga store.
#[derive(Clone)]
pub struct PostgresSagaStore {
    pool: PgPool,
}

impl PostgresSagaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects to `database_url` and returns a store.
    ///
    /// Failing to connect is reported to the caller; services treat it as
    /// fatal at startup.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn row_to_event(row: PgRow) -> Result<StoredEvent> {
        Ok(StoredEvent {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("id")?),
            saga_id: SagaId::from_uuid(row.try_get::<Uuid, _>("saga_id")?),
            saga_type: row.try_get("saga_type")?,
            event_type: row.try_get("event_type")?,
            version: Version::new(row.try_get("version")?),
            recorded_at: row.try_get("recorded_at")?,
            payload: row.try_get("payload")?,
        })
    }
}

#[async_trait]
impl SagaStore for PostgresSagaStore {
    async fn append(&self, events: Vec<StoredEvent>, options: AppendOptions) -> Result<Version> {
        validate_batch(&events)?;
        let saga_id = events[0].saga_id;

        let mut tx = self.pool.begin().await?;

        if let Some(expected) = options.expected_version {
            let current: Option<i64> =
                sqlx::query_scalar("SELECT MAX(version) FROM saga_events WHERE saga_id = $1")
                    .bind(saga_id.as_uuid())
                    .fetch_one(&mut *tx)
                    .await?;
            let actual = Version::new(current.unwrap_or(0));
            if actual != expected {
                return Err(SagaStoreError::ConcurrencyConflict {
                    saga_id,
                    expected,
                    actual,
                });
            }
        }

        let mut last = Version::initial();
        for event in &events {
            sqlx::query(
                r#"
                INSERT INTO saga_events (id, saga_id, saga_type, event_type, version, recorded_at, payload)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(event.event_id.as_uuid())
            .bind(event.saga_id.as_uuid())
            .bind(&event.saga_type)
            .bind(&event.event_type)
            .bind(event.version.as_i64())
            .bind(event.recorded_at)
            .bind(&event.payload)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                // A concurrent writer committed the same version first.
                if let sqlx::Error::Database(ref db_err) = e
                    && db_err.constraint() == Some("unique_saga_version")
                {
                    return SagaStoreError::ConcurrencyConflict {
                        saga_id,
                        expected: options.expected_version.unwrap_or_default(),
                        actual: event.version,
                    };
                }
                SagaStoreError::Database(e)
            })?;
            last = event.version;
        }

        tx.commit().await?;
        metrics::counter!("saga_store_events_appended_total").increment(events.len() as u64);
        Ok(last)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Vec<StoredEvent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, saga_id, saga_type, event_type, version, recorded_at, payload
            FROM saga_events
            WHERE saga_id = $1
            ORDER BY version ASC
            "#,
        )
        .bind(saga_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_event).collect()
    }

    async fn current_version(&self, saga_id: SagaId) -> Result<Option<Version>> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM saga_events WHERE saga_id = $1")
                .bind(saga_id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
        Ok(version.map(Version::new))
    }

    async fn open_saga_ids(
        &self,
        saga_type: &str,
        terminal_event_types: &[&str],
    ) -> Result<Vec<SagaId>> {
        let terminal: Vec<String> = terminal_event_types.iter().map(|s| s.to_string()).collect();
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT saga_id
            FROM saga_events
            WHERE saga_type = $1
              AND saga_id NOT IN (
                  SELECT saga_id FROM saga_events WHERE event_type = ANY($2)
              )
            ORDER BY saga_id
            "#,
        )
        .bind(saga_type)
        .bind(&terminal)
        .fetch_all(&self.pool)
        .await?;

        tracing::debug!(saga_type, open = ids.len(), "listed open sagas");
        Ok(ids.into_iter().map(SagaId::from_uuid).collect())
    }
}
