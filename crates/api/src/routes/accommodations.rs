//! Listing creation for hosts: starts a CreateAccommodation saga.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use bus::MessageBus;
use chrono::NaiveDate;
use domain::{AccommodationWithAvailability, Price, Role};
use saga_store::SagaStore;
use serde::Deserialize;

use crate::context::AppContext;
use crate::error::ApiError;
use crate::identity::{Identity, IdentityError};
use crate::routes::users::SagaAcceptedResponse;

#[derive(Debug, Deserialize)]
pub struct CreateAccommodationRequest {
    pub name: String,
    pub location: String,
    pub min_guests: u32,
    pub max_guests: u32,
    #[serde(default)]
    pub amenities: Vec<String>,
    #[serde(default)]
    pub price: Option<Price>,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
}

impl CreateAccommodationRequest {
    /// The listing belongs to the caller, whatever the body says.
    fn into_listing(self, host: &Identity) -> AccommodationWithAvailability {
        let mut listing = AccommodationWithAvailability::new(
            host.user_id.clone(),
            self.name,
            self.location,
            self.min_guests,
            self.max_guests,
        )
        .with_amenities(self.amenities);
        listing.price = self.price;
        listing.start_date = self.start_date;
        listing.end_date = self.end_date;
        listing
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, IdentityError> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(IdentityError::MissingToken)
}

/// POST /accommodations
#[tracing::instrument(skip(ctx, headers, req), fields(name = %req.name))]
pub async fn create<S, B>(
    State(ctx): State<Arc<AppContext<S, B>>>,
    headers: HeaderMap,
    Json(req): Json<CreateAccommodationRequest>,
) -> Result<(StatusCode, Json<SagaAcceptedResponse>), ApiError>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    let identity = ctx.identity.resolve(bearer_token(&headers)?)?;
    if identity.role != Role::Host {
        return Err(ApiError::Forbidden(format!(
            "user {} is not a host",
            identity.user_id
        )));
    }

    let listing = req.into_listing(&identity);
    let entity_id = listing.id.to_string();
    let saga_id = ctx.accommodations.start(listing).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(SagaAcceptedResponse {
            saga_id: saga_id.to_string(),
            entity_id,
        }),
    ))
}
