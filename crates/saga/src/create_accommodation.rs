//! CreateAccommodation saga definition.
//!
//! The parent saga adds the listing, then either runs the availability step
//! as a linked `CreateAvailability` child saga (when the listing arrived
//! without a complete price and date window) or goes straight to the
//! recommendation graph.

use domain::{
    AccommodationCommandType, AccommodationReplyType, AccommodationWithAvailability,
    CreateAccommodation,
};

use crate::definition::{Outcome, SagaDefinition, Transition};

pub const SAGA_TYPE: &str = "CreateAccommodation";
pub const AVAILABILITY_SAGA_TYPE: &str = "CreateAvailability";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccommodationSagaKind {
    /// Listing, availability (via child), recommendation.
    CreateAccommodation,
    /// The availability step on its own, linked to a parent.
    CreateAvailability,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CreateAccommodationSaga;

impl SagaDefinition for CreateAccommodationSaga {
    type Schema = CreateAccommodation;
    type Kind = AccommodationSagaKind;

    const ROOT: AccommodationSagaKind = AccommodationSagaKind::CreateAccommodation;
    const KINDS: &'static [AccommodationSagaKind] = &[
        AccommodationSagaKind::CreateAccommodation,
        AccommodationSagaKind::CreateAvailability,
    ];

    fn kind_name(kind: AccommodationSagaKind) -> &'static str {
        match kind {
            AccommodationSagaKind::CreateAccommodation => SAGA_TYPE,
            AccommodationSagaKind::CreateAvailability => AVAILABILITY_SAGA_TYPE,
        }
    }

    fn initial_command(kind: AccommodationSagaKind) -> AccommodationCommandType {
        match kind {
            AccommodationSagaKind::CreateAccommodation => {
                AccommodationCommandType::AddAccommodation
            }
            AccommodationSagaKind::CreateAvailability => AccommodationCommandType::AddAvailability,
        }
    }

    fn transition(
        kind: AccommodationSagaKind,
        reply: AccommodationReplyType,
        entity: &AccommodationWithAvailability,
    ) -> Transition<AccommodationSagaKind, AccommodationCommandType> {
        match kind {
            AccommodationSagaKind::CreateAccommodation => listing_transition(reply, entity),
            AccommodationSagaKind::CreateAvailability => availability_transition(reply),
        }
    }

    fn answers(step: AccommodationCommandType) -> &'static [AccommodationReplyType] {
        use AccommodationCommandType as C;
        use AccommodationReplyType as R;

        match step {
            C::AddAccommodation => &[R::AccommodationAdded, R::AccommodationNotAdded],
            // A child relays its own cleanup failure to the parent's step.
            C::AddAvailability => &[
                R::AvailabilityAdded,
                R::AvailabilityNotAdded,
                R::CompensationFailed,
            ],
            C::AddRecommendation => &[R::RecommendationAdded, R::RecommendationNotAdded],
            C::RollbackAccommodation => &[R::AccommodationRolledBack, R::CompensationFailed],
            C::CancelAvailability => &[R::AvailabilityCancelled, R::CompensationFailed],
            C::RemoveRecommendation => &[R::RecommendationRemoved, R::CompensationFailed],
            C::Unknown => &[],
        }
    }

    fn rollback(step: AccommodationCommandType) -> Option<AccommodationCommandType> {
        use AccommodationCommandType as C;

        match step {
            C::AddAccommodation => Some(C::RollbackAccommodation),
            C::AddAvailability => Some(C::CancelAvailability),
            C::AddRecommendation => Some(C::RemoveRecommendation),
            C::RollbackAccommodation
            | C::CancelAvailability
            | C::RemoveRecommendation
            | C::Unknown => None,
        }
    }

    fn cancel(step: AccommodationCommandType) -> Option<AccommodationCommandType> {
        // Every forward step here has a single undo that also works as a
        // tombstone when the effect never landed.
        Self::rollback(step)
    }

    fn relay(kind: AccommodationSagaKind, outcome: Outcome) -> Option<AccommodationReplyType> {
        match kind {
            AccommodationSagaKind::CreateAccommodation => None,
            AccommodationSagaKind::CreateAvailability => Some(match outcome {
                Outcome::Completed => AccommodationReplyType::AvailabilityAdded,
                Outcome::Failed => AccommodationReplyType::AvailabilityNotAdded,
                Outcome::CompensationFailed => AccommodationReplyType::CompensationFailed,
            }),
        }
    }
}

fn listing_transition(
    reply: AccommodationReplyType,
    entity: &AccommodationWithAvailability,
) -> Transition<AccommodationSagaKind, AccommodationCommandType> {
    use AccommodationCommandType as C;
    use AccommodationReplyType as R;

    match reply {
        R::AccommodationAdded if entity.needs_availability_step() => Transition::SubSaga {
            kind: AccommodationSagaKind::CreateAvailability,
            command: C::AddAvailability,
        },
        R::AccommodationAdded => Transition::Advance(C::AddRecommendation),
        R::AccommodationNotAdded => Transition::Compensate(C::RollbackAccommodation),
        R::AvailabilityAdded => Transition::Advance(C::AddRecommendation),
        R::AvailabilityNotAdded => Transition::Compensate(C::RollbackAccommodation),
        R::RecommendationAdded => Transition::Complete,
        R::RecommendationNotAdded => Transition::Compensate(C::RemoveRecommendation),
        R::AccommodationRolledBack | R::AvailabilityCancelled | R::RecommendationRemoved => {
            Transition::Compensated
        }
        R::CompensationFailed => Transition::CompensationFailed,
        R::Unknown => Transition::Ignore,
    }
}

fn availability_transition(
    reply: AccommodationReplyType,
) -> Transition<AccommodationSagaKind, AccommodationCommandType> {
    use AccommodationCommandType as C;
    use AccommodationReplyType as R;

    match reply {
        R::AvailabilityAdded => Transition::Complete,
        R::AvailabilityNotAdded => Transition::Compensate(C::CancelAvailability),
        R::AvailabilityCancelled => Transition::Compensated,
        R::CompensationFailed => Transition::CompensationFailed,
        R::AccommodationAdded
        | R::AccommodationNotAdded
        | R::AccommodationRolledBack
        | R::RecommendationAdded
        | R::RecommendationNotAdded
        | R::RecommendationRemoved
        | R::Unknown => Transition::Ignore,
    }
}
