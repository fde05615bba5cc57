//! Saga record lookup.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use bus::MessageBus;
use chrono::{DateTime, Utc};
use common::SagaId;
use saga::{AwaitingStep, SagaInstance};
use saga_store::SagaStore;
use serde::Serialize;

use crate::context::AppContext;
use crate::error::ApiError;

#[derive(Debug, Serialize)]
pub struct SagaStatusResponse {
    pub saga_id: String,
    pub saga_type: String,
    pub entity_id: String,
    pub parent_id: Option<String>,
    pub child_id: Option<String>,
    pub state: String,
    pub awaiting: Option<AwaitingStep>,
    pub completed_steps: Vec<String>,
    pub compensation_plan: Vec<String>,
    pub compensated_steps: Vec<String>,
    pub failure_reason: Option<String>,
    pub entity: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SagaStatusResponse {
    fn new(saga_id: SagaId, saga: &SagaInstance) -> Self {
        Self {
            saga_id: saga_id.to_string(),
            saga_type: saga.saga_type().to_string(),
            entity_id: saga.entity_id().to_string(),
            parent_id: saga.parent_id().map(|id| id.to_string()),
            child_id: saga.delegated_to().map(|id| id.to_string()),
            state: saga.state().as_str().to_string(),
            awaiting: saga.awaiting().cloned(),
            completed_steps: saga.completed_steps().to_vec(),
            compensation_plan: saga.compensation_plan().to_vec(),
            compensated_steps: saga.compensated_steps().to_vec(),
            failure_reason: saga.failure_reason().map(String::from),
            entity: saga.entity().clone(),
            created_at: saga.created_at(),
            updated_at: saga.updated_at(),
        }
    }
}

/// GET /sagas/{id}
#[tracing::instrument(skip(ctx))]
pub async fn get<S, B>(
    State(ctx): State<Arc<AppContext<S, B>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    let saga_id = SagaId::parse(&id)
        .map_err(|e| ApiError::BadRequest(format!("invalid saga id: {e}")))?;

    let log = ctx
        .store
        .load(saga_id)
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    let saga = SagaInstance::from_log(saga_id, &log)?
        .ok_or_else(|| ApiError::NotFound(format!("saga {id} not found")))?;

    Ok(Json(SagaStatusResponse::new(saga_id, &saga)))
}
