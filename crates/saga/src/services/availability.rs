//! Availability service: price and bookable date range of a listing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::NaiveDate;
use common::EntityId;
use domain::{
    AccommodationCommandType, AccommodationReplyType, AccommodationWithAvailability,
    CreateAccommodation, Price,
};

use crate::error::EffectError;
use crate::participant::{Participant, Route};

/// A stored availability window. Missing fields mean "on request".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailabilityWindow {
    pub availability_id: String,
    pub price: Option<Price>,
    pub start_date: Option<NaiveDate>,
    pub end_date: Option<NaiveDate>,
}

#[derive(Debug, Default)]
struct AvailabilityState {
    windows: HashMap<EntityId, AvailabilityWindow>,
    cancelled: HashSet<EntityId>,
    next_id: u32,
    fail_on_add: bool,
    fail_on_cancel: bool,
}

/// In-memory availability store. Assigns ids like `AV-0001`.
#[derive(Debug, Clone, Default)]
pub struct AvailabilityStore {
    state: Arc<RwLock<AvailabilityState>>,
}

impl AvailabilityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, AvailabilityState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, AvailabilityState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_on_add(&self, fail: bool) {
        self.write().fail_on_add = fail;
    }

    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.write().fail_on_cancel = fail;
    }

    pub fn window(&self, listing_id: &EntityId) -> Option<AvailabilityWindow> {
        self.read().windows.get(listing_id).cloned()
    }

    pub fn window_count(&self) -> usize {
        self.read().windows.len()
    }

    fn add(
        &self,
        listing: &AccommodationWithAvailability,
    ) -> Result<AccommodationWithAvailability, EffectError> {
        let mut state = self.write();
        if state.fail_on_add {
            return Err(EffectError::rejected(format!(
                "no availability for {}",
                listing.name
            )));
        }
        if state.cancelled.contains(&listing.id) {
            return Err(EffectError::cancelled(&listing.id, "AddAvailability"));
        }

        state.next_id += 1;
        let availability_id = format!("AV-{:04}", state.next_id);
        state.windows.insert(
            listing.id.clone(),
            AvailabilityWindow {
                availability_id: availability_id.clone(),
                price: listing.price,
                start_date: listing.start_date,
                end_date: listing.end_date,
            },
        );

        let mut enriched = listing.clone();
        enriched.availability_id = Some(availability_id);
        Ok(enriched)
    }

    fn cancel(&self, listing: &AccommodationWithAvailability) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_cancel {
            return Err(EffectError::rejected("availability store unavailable"));
        }
        state.windows.remove(&listing.id);
        state.cancelled.insert(listing.id.clone());
        Ok(())
    }
}

#[async_trait]
impl Participant<CreateAccommodation> for AvailabilityStore {
    fn name(&self) -> &'static str {
        "availability"
    }

    fn route(
        &self,
        command: AccommodationCommandType,
    ) -> Option<Route<AccommodationReplyType>> {
        use AccommodationCommandType as C;
        use AccommodationReplyType as R;

        match command {
            C::AddAvailability => Some(Route::forward(
                R::AvailabilityAdded,
                R::AvailabilityNotAdded,
            )),
            C::CancelAvailability => Some(Route::compensating(
                R::AvailabilityCancelled,
                R::CompensationFailed,
            )),
            C::AddAccommodation
            | C::RollbackAccommodation
            | C::AddRecommendation
            | C::RemoveRecommendation
            | C::Unknown => None,
        }
    }

    async fn apply(
        &self,
        command: AccommodationCommandType,
        listing: &AccommodationWithAvailability,
    ) -> Result<Option<AccommodationWithAvailability>, EffectError> {
        match command {
            AccommodationCommandType::AddAvailability => self.add(listing).map(Some),
            AccommodationCommandType::CancelAvailability => {
                self.cancel(listing)?;
                Ok(None)
            }
            other => Err(EffectError::rejected(format!("availability cannot {other}"))),
        }
    }
}
