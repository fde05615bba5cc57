//! Listing service: the accommodation document itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::EntityId;
use domain::{
    AccommodationCommandType, AccommodationReplyType, AccommodationWithAvailability,
    CreateAccommodation,
};

use crate::error::EffectError;
use crate::participant::{Participant, Route};

#[derive(Debug, Default)]
struct ListingState {
    listings: HashMap<EntityId, AccommodationWithAvailability>,
    rolled_back: HashSet<EntityId>,
    fail_on_add: bool,
    fail_on_rollback: bool,
}

/// In-memory listing store.
#[derive(Debug, Clone, Default)]
pub struct ListingStore {
    state: Arc<RwLock<ListingState>>,
}

impl ListingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ListingState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ListingState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_on_add(&self, fail: bool) {
        self.write().fail_on_add = fail;
    }

    pub fn set_fail_on_rollback(&self, fail: bool) {
        self.write().fail_on_rollback = fail;
    }

    pub fn listing(&self, id: &EntityId) -> Option<AccommodationWithAvailability> {
        self.read().listings.get(id).cloned()
    }

    pub fn listing_count(&self) -> usize {
        self.read().listings.len()
    }

    /// Listings owned by a host.
    pub fn by_host(&self, host_id: &EntityId) -> Vec<AccommodationWithAvailability> {
        self.read()
            .listings
            .values()
            .filter(|l| &l.host_id == host_id)
            .cloned()
            .collect()
    }

    fn add(&self, listing: &AccommodationWithAvailability) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_add {
            return Err(EffectError::rejected(format!(
                "listing store refused {}",
                listing.name
            )));
        }
        if state.rolled_back.contains(&listing.id) {
            return Err(EffectError::cancelled(&listing.id, "AddAccommodation"));
        }
        state.listings.insert(listing.id.clone(), listing.clone());
        Ok(())
    }

    fn rollback(&self, listing: &AccommodationWithAvailability) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_rollback {
            return Err(EffectError::rejected("listing store unavailable"));
        }
        state.listings.remove(&listing.id);
        state.rolled_back.insert(listing.id.clone());
        Ok(())
    }
}

#[async_trait]
impl Participant<CreateAccommodation> for ListingStore {
    fn name(&self) -> &'static str {
        "listing"
    }

    fn route(
        &self,
        command: AccommodationCommandType,
    ) -> Option<Route<AccommodationReplyType>> {
        use AccommodationCommandType as C;
        use AccommodationReplyType as R;

        match command {
            C::AddAccommodation => Some(Route::forward(
                R::AccommodationAdded,
                R::AccommodationNotAdded,
            )),
            C::RollbackAccommodation => Some(Route::compensating(
                R::AccommodationRolledBack,
                R::CompensationFailed,
            )),
            C::AddAvailability
            | C::CancelAvailability
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
            AccommodationCommandType::AddAccommodation => self.add(listing)?,
            AccommodationCommandType::RollbackAccommodation => self.rollback(listing)?,
            other => return Err(EffectError::rejected(format!("listing cannot {other}"))),
        }
        Ok(None)
    }
}
