//! User sign-up: starts a CreateUser saga.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use bus::MessageBus;
use domain::{Role, User};
use saga_store::SagaStore;
use serde::{Deserialize, Serialize};

use crate::context::AppContext;
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub username: String,
    pub email: String,
    #[serde(default)]
    pub role: Role,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    #[serde(default)]
    pub city: String,
}

impl CreateUserRequest {
    fn into_user(self) -> User {
        User::new(self.username, self.email, self.role)
            .with_name(self.first_name, self.last_name)
            .with_city(self.city)
    }
}

/// Returned by every endpoint that starts a saga.
#[derive(Debug, Serialize)]
pub struct SagaAcceptedResponse {
    pub saga_id: String,
    pub entity_id: String,
}

/// POST /users
#[tracing::instrument(skip(ctx, req), fields(username = %req.username))]
pub async fn create<S, B>(
    State(ctx): State<Arc<AppContext<S, B>>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<SagaAcceptedResponse>), ApiError>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    let user = req.into_user();
    let entity_id = user.id.to_string();
    let saga_id = ctx.users.start(user).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SagaAcceptedResponse {
            saga_id: saga_id.to_string(),
            entity_id,
        }),
    ))
}
