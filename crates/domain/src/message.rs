//! Saga message schema: the Command and Reply kinds exchanged over the bus.
//!
//! Each saga kind is described by a [`SagaSchema`] marker type naming its
//! entity payload, its closed command and reply vocabularies and its topics.
//! [`Command`] and [`Reply`] are generic over that marker, so
//! `Command<CreateUser>` is the `CreateUserCommand` of the wire protocol.

use std::fmt::{Debug, Display};
use std::hash::Hash;

use chrono::{DateTime, Utc};
use common::{EntityId, SagaId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ValidationError;

/// A closed, enumerable set of message type tags.
///
/// Values travel as their variant name. A name this build does not know
/// decodes to [`MessageType::unknown`] instead of failing, so older services
/// keep working when the vocabulary grows.
pub trait MessageType:
    Copy + Eq + Hash + Debug + Display + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Every value of the vocabulary, `Unknown` included.
    const ALL: &'static [Self];

    fn as_str(&self) -> &'static str;

    /// The catch-all value for unrecognised tags.
    fn unknown() -> Self;

    fn parse(s: &str) -> Self {
        Self::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .unwrap_or_else(Self::unknown)
    }

    fn is_unknown(&self) -> bool {
        *self == Self::unknown()
    }
}

/// Declares a message type enum with a trailing `Unknown` variant.
macro_rules! message_type {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $( $(#[$vmeta:meta])* $variant:ident ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name {
            $( $(#[$vmeta])* $variant, )+
            /// A tag this build does not recognise.
            Unknown,
        }

        impl $crate::message::MessageType for $name {
            const ALL: &'static [Self] = &[$( Self::$variant, )+ Self::Unknown];

            fn as_str(&self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )+
                    Self::Unknown => "Unknown",
                }
            }

            fn unknown() -> Self {
                Self::Unknown
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str($crate::message::MessageType::as_str(self))
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str($crate::message::MessageType::as_str(self))
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let tag = <String as serde::Deserialize>::deserialize(deserializer)?;
                Ok(<Self as $crate::message::MessageType>::parse(&tag))
            }
        }
    };
}

pub(crate) use message_type;

/// An entity snapshot carried as the payload of every saga message.
pub trait SagaEntity:
    Clone + Debug + PartialEq + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn entity_id(&self) -> &EntityId;

    /// Checks the snapshot before it crosses the saga boundary.
    fn validate(&self) -> Result<(), ValidationError>;
}

/// Describes one saga kind's wire protocol.
pub trait SagaSchema: Debug + Clone + Copy + PartialEq + Send + Sync + 'static {
    type Entity: SagaEntity;
    type CommandType: MessageType;
    type ReplyType: MessageType;

    /// Saga kind name, used as the saga type in the log.
    const NAME: &'static str;
    const COMMAND_TOPIC: &'static str;
    const REPLY_TOPIC: &'static str;
}

/// Envelope fields common to every command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandMeta {
    /// Correlation id of the saga instance that issued the command.
    pub saga_id: SagaId,
    pub message_id: Uuid,
    /// 1 for the first publication, incremented by each retry.
    pub attempt: u32,
    pub issued_at: DateTime<Utc>,
}

/// Envelope fields common to every reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyMeta {
    pub saga_id: SagaId,
    pub message_id: Uuid,
    /// `message_id` of the command being answered.
    pub correlation_id: Uuid,
    pub replied_at: DateTime<Utc>,
}

/// Key under which a participant records that it applied a step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdempotencyKey {
    pub entity_id: EntityId,
    pub step: String,
}

impl Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.entity_id, self.step)
    }
}

/// A request for one participant to apply one local effect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Command<S: SagaSchema> {
    pub meta: CommandMeta,
    pub payload: S::Entity,
    #[serde(rename = "type")]
    pub kind: S::CommandType,
}

impl<S: SagaSchema> Command<S> {
    pub fn new(saga_id: SagaId, kind: S::CommandType, payload: S::Entity, attempt: u32) -> Self {
        Self {
            meta: CommandMeta {
                saga_id,
                message_id: Uuid::new_v4(),
                attempt,
                issued_at: Utc::now(),
            },
            payload,
            kind,
        }
    }

    pub fn saga_id(&self) -> SagaId {
        self.meta.saga_id
    }

    pub fn entity_id(&self) -> &EntityId {
        self.payload.entity_id()
    }

    /// Entity id plus step: redelivering a command must not apply it twice.
    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey {
            entity_id: self.entity_id().clone(),
            step: self.kind.as_str().to_string(),
        }
    }

    /// Builds the reply answering this command.
    pub fn reply(&self, kind: S::ReplyType, payload: S::Entity) -> Reply<S> {
        Reply {
            meta: ReplyMeta {
                saga_id: self.meta.saga_id,
                message_id: Uuid::new_v4(),
                correlation_id: self.meta.message_id,
                replied_at: Utc::now(),
            },
            in_reply_to: self.kind,
            payload,
            kind,
            reason: None,
        }
    }
}

/// The outcome of one command, as reported by the participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound = "")]
pub struct Reply<S: SagaSchema> {
    pub meta: ReplyMeta,
    /// The command type this reply answers.
    pub in_reply_to: S::CommandType,
    /// The entity snapshot, possibly enriched by the participant.
    pub payload: S::Entity,
    #[serde(rename = "type")]
    pub kind: S::ReplyType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl<S: SagaSchema> Reply<S> {
    /// Builds a reply that was not produced by a participant, such as a child
    /// saga reporting its outcome to its parent.
    pub fn synthetic(
        saga_id: SagaId,
        in_reply_to: S::CommandType,
        kind: S::ReplyType,
        payload: S::Entity,
    ) -> Self {
        Self {
            meta: ReplyMeta {
                saga_id,
                message_id: Uuid::new_v4(),
                correlation_id: Uuid::nil(),
                replied_at: Utc::now(),
            },
            in_reply_to,
            payload,
            kind,
            reason: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn saga_id(&self) -> SagaId {
        self.meta.saga_id
    }
}

impl<S: SagaSchema> bus::Message for Command<S> {
    const TOPIC: &'static str = S::COMMAND_TOPIC;

    fn validate(&self) -> Result<(), String> {
        self.payload.validate().map_err(|e| e.to_string())
    }
}

impl<S: SagaSchema> bus::Message for Reply<S> {
    const TOPIC: &'static str = S::REPLY_TOPIC;

    fn validate(&self) -> Result<(), String> {
        self.payload.validate().map_err(|e| e.to_string())
    }
}
