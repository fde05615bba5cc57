//! Recommendation graph: links listings that share a location.

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

#[derive(Debug, Clone)]
struct Node {
    host_id: EntityId,
    location: String,
    amenities: HashSet<String>,
}

#[derive(Debug, Default)]
struct GraphState {
    nodes: HashMap<EntityId, Node>,
    removed: HashSet<EntityId>,
    fail_on_add: bool,
    fail_on_remove: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecommendationGraph {
    state: Arc<RwLock<GraphState>>,
}

impl RecommendationGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_on_add(&self, fail: bool) {
        self.write().fail_on_add = fail;
    }

    pub fn set_fail_on_remove(&self, fail: bool) {
        self.write().fail_on_remove = fail;
    }

    pub fn contains(&self, listing_id: &EntityId) -> bool {
        self.read().nodes.contains_key(listing_id)
    }

    pub fn node_count(&self) -> usize {
        self.read().nodes.len()
    }

    /// Listings in the same location from other hosts, those sharing the
    /// most amenities first. Ties are ordered by id.
    pub fn similar_to(&self, listing_id: &EntityId) -> Vec<EntityId> {
        let state = self.read();
        let Some(origin) = state.nodes.get(listing_id) else {
            return Vec::new();
        };

        let mut scored: Vec<(usize, &EntityId)> = state
            .nodes
            .iter()
            .filter(|(id, node)| {
                *id != listing_id
                    && node.host_id != origin.host_id
                    && node.location.eq_ignore_ascii_case(&origin.location)
            })
            .map(|(id, node)| (node.amenities.intersection(&origin.amenities).count(), id))
            .collect();
        scored.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.as_str().cmp(b.1.as_str())));
        scored.into_iter().map(|(_, id)| id.clone()).collect()
    }

    fn add(&self, listing: &AccommodationWithAvailability) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_add {
            return Err(EffectError::rejected("recommendation graph unreachable"));
        }
        if state.removed.contains(&listing.id) {
            return Err(EffectError::cancelled(&listing.id, "AddRecommendation"));
        }
        state.nodes.insert(
            listing.id.clone(),
            Node {
                host_id: listing.host_id.clone(),
                location: listing.location.clone(),
                amenities: listing.amenities.iter().cloned().collect(),
            },
        );
        Ok(())
    }

    fn remove(&self, listing: &AccommodationWithAvailability) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_remove {
            return Err(EffectError::rejected("recommendation graph unreachable"));
        }
        state.nodes.remove(&listing.id);
        state.removed.insert(listing.id.clone());
        Ok(())
    }
}

#[async_trait]
impl Participant<CreateAccommodation> for RecommendationGraph {
    fn name(&self) -> &'static str {
        "recommendation"
    }

    fn route(
        &self,
        command: AccommodationCommandType,
    ) -> Option<Route<AccommodationReplyType>> {
        use AccommodationCommandType as C;
        use AccommodationReplyType as R;

        match command {
            C::AddRecommendation => Some(Route::forward(
                R::RecommendationAdded,
                R::RecommendationNotAdded,
            )),
            C::RemoveRecommendation => Some(Route::compensating(
                R::RecommendationRemoved,
                R::CompensationFailed,
            )),
            C::AddAccommodation
            | C::RollbackAccommodation
            | C::AddAvailability
            | C::CancelAvailability
            | C::Unknown => None,
        }
    }

    async fn apply(
        &self,
        command: AccommodationCommandType,
        listing: &AccommodationWithAvailability,
    ) -> Result<Option<AccommodationWithAvailability>, EffectError> {
        match command {
            AccommodationCommandType::AddRecommendation => self.add(listing)?,
            AccommodationCommandType::RemoveRecommendation => self.remove(listing)?,
            other => {
                return Err(EffectError::rejected(format!(
                    "recommendation graph cannot {other}"
                )));
            }
        }
        Ok(None)
    }
}
