//! Saga orchestration for the CreateUser and CreateAccommodation flows.
//!
//! A saga is a sequence of local steps owned by independent services. The
//! [`Orchestrator`] issues one command at a time over the bus, records every
//! decision in an event-sourced [`SagaInstance`] and, when a step fails,
//! issues compensating commands in reverse order. Participants apply one
//! local effect per command through a [`ParticipantHandler`].
//!
//! CreateUser steps:
//! 1. Add user (identity store)
//! 2. Add profile (profile store)
//! 3. Send welcome mail (mailer)
//!
//! CreateAccommodation steps:
//! 1. Add listing (listing store)
//! 2. Add availability, as a linked child saga, when the listing has no
//!    complete price and date window
//! 3. Add to the recommendation graph

pub mod aggregate;
pub mod alert;
pub mod create_accommodation;
pub mod create_user;
pub mod definition;
pub mod error;
pub mod events;
pub mod orchestrator;
pub mod participant;
pub mod services;
pub mod state;

pub use aggregate::{AwaitingStep, SagaInstance, StepFailure};
pub use alert::{Alert, AlertSink, LogAlertSink, RecordingAlertSink};
pub use create_accommodation::{AccommodationSagaKind, CreateAccommodationSaga};
pub use create_user::{CreateUserSaga, UserSagaKind};
pub use definition::{Outcome, SagaDefinition, Transition, compensation_plan};
pub use error::{EffectError, SagaError};
pub use events::SagaEvent;
pub use orchestrator::{HandleOutcome, Orchestrator, OrchestratorConfig, SweepReport};
pub use participant::{
    Claim, IdempotencyStore, InMemoryIdempotencyStore, Participant, ParticipantHandler, Route,
};
pub use services::{
    AccommodationServices, AvailabilityStore, IdentityStore, ListingStore, Mailer, ProfileStore,
    RecommendationGraph, UserServices,
};
pub use state::SagaState;

/// Orchestrator for CreateUser sagas.
pub type UserOrchestrator<S, B> = Orchestrator<CreateUserSaga, S, B>;
/// Orchestrator for CreateAccommodation sagas and their availability children.
pub type AccommodationOrchestrator<S, B> = Orchestrator<CreateAccommodationSaga, S, B>;
