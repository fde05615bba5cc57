//! Domain layer for the saga coordinator.
//!
//! This crate provides:
//! - the generic [`Command`]/[`Reply`] message schema and [`SagaSchema`]
//! - the CreateUser and CreateAccommodation vocabularies and entities
//! - the [`Aggregate`]/[`DomainEvent`] traits saga instances implement

pub mod accommodation;
pub mod aggregate;
pub mod error;
pub mod message;
pub mod user;

pub use accommodation::{
    AccommodationCommandType, AccommodationReplyType, AccommodationWithAvailability,
    CreateAccommodation, CreateAccommodationCommand, CreateAccommodationReply, Price,
};
pub use aggregate::{Aggregate, DomainEvent};
pub use common::{EntityId, SagaId};
pub use error::ValidationError;
pub use message::{
    Command, CommandMeta, IdempotencyKey, MessageType, Reply, ReplyMeta, SagaEntity, SagaSchema,
};
pub use user::{CreateUser, CreateUserCommand, CreateUserReply, Role, User, UserCommandType, UserReplyType};
