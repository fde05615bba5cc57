//! In-memory participant services for both sagas.
//!
//! Each store owns its local state behind an `Arc<RwLock<_>>`, so clones
//! share state and tests can inspect what a saga did. Failure toggles make a
//! store reject its forward or compensating command.

pub mod availability;
pub mod identity;
pub mod listing;
pub mod mailer;
pub mod profile;
pub mod recommendation;

use std::sync::Arc;

use bus::{MessageBus, RetryPolicy};
use domain::{CreateAccommodation, CreateUser};

use crate::participant::{Participant, ParticipantHandler};

pub use availability::{AvailabilityStore, AvailabilityWindow};
pub use identity::IdentityStore;
pub use listing::ListingStore;
pub use mailer::{Mail, Mailer};
pub use profile::{Profile, ProfileStore};
pub use recommendation::RecommendationGraph;

/// The three services taking part in CreateUser.
#[derive(Debug, Clone, Default)]
pub struct UserServices {
    pub identity: IdentityStore,
    pub profiles: ProfileStore,
    pub mailer: Mailer,
}

impl UserServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes every service to `create_user.command`, each under its own
    /// consumer group.
    pub async fn subscribe<B>(&self, bus: &Arc<B>, retry: RetryPolicy) -> bus::Result<()>
    where
        B: MessageBus + 'static,
    {
        let participants: [Arc<dyn Participant<CreateUser>>; 3] = [
            Arc::new(self.identity.clone()),
            Arc::new(self.profiles.clone()),
            Arc::new(self.mailer.clone()),
        ];
        for participant in participants {
            ParticipantHandler::new(participant, bus.clone(), retry)
                .subscribe()
                .await?;
        }
        Ok(())
    }
}

/// The three services taking part in CreateAccommodation.
#[derive(Debug, Clone, Default)]
pub struct AccommodationServices {
    pub listings: ListingStore,
    pub availability: AvailabilityStore,
    pub recommendations: RecommendationGraph,
}

impl AccommodationServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn subscribe<B>(&self, bus: &Arc<B>, retry: RetryPolicy) -> bus::Result<()>
    where
        B: MessageBus + 'static,
    {
        let participants: [Arc<dyn Participant<CreateAccommodation>>; 3] = [
            Arc::new(self.listings.clone()),
            Arc::new(self.availability.clone()),
            Arc::new(self.recommendations.clone()),
        ];
        for participant in participants {
            ParticipantHandler::new(participant, bus.clone(), retry)
                .subscribe()
                .await?;
        }
        Ok(())
    }
}
