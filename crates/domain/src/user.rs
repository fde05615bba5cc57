//! The CreateUser saga: user entity and message vocabulary.

use common::EntityId;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;
use crate::message::{self, SagaEntity, SagaSchema, message_type};

pub const CREATE_USER_COMMAND_TOPIC: &str = "create_user.command";
pub const CREATE_USER_REPLY_TOPIC: &str = "create_user.reply";

/// What a user is allowed to do on the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Role {
    #[default]
    Guest,
    Host,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Guest => "Guest",
            Role::Host => "Host",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user snapshot carried through every CreateUser message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: EntityId,
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

impl User {
    /// Creates a user with a generated id and empty personal details.
    pub fn new(username: impl Into<String>, email: impl Into<String>, role: Role) -> Self {
        Self {
            id: EntityId::generate(),
            username: username.into(),
            email: email.into(),
            role,
            first_name: String::new(),
            last_name: String::new(),
            city: String::new(),
        }
    }

    pub fn with_name(mut self, first: impl Into<String>, last: impl Into<String>) -> Self {
        self.first_name = first.into();
        self.last_name = last.into();
        self
    }

    pub fn with_city(mut self, city: impl Into<String>) -> Self {
        self.city = city.into();
        self
    }
}

impl SagaEntity for User {
    fn entity_id(&self) -> &EntityId {
        &self.id
    }

    fn validate(&self) -> Result<(), ValidationError> {
        if self.id.is_blank() {
            return Err(ValidationError::Missing { field: "id" });
        }
        if self.username.trim().is_empty() {
            return Err(ValidationError::Missing { field: "username" });
        }
        if self.email.trim().is_empty() {
            return Err(ValidationError::Missing { field: "email" });
        }
        match self.email.split_once('@') {
            Some((local, domain)) if !local.is_empty() && !domain.is_empty() => Ok(()),
            _ => Err(ValidationError::invalid("email", "expected local@domain")),
        }
    }
}

message_type! {
    /// Commands of the CreateUser saga.
    pub enum UserCommandType {
        AddUser,
        RollbackUser,
        AddProfile,
        CancelProfile,
        RollbackProfile,
        SendMail,
        CancelMail,
    }
}

message_type! {
    /// Replies of the CreateUser saga.
    pub enum UserReplyType {
        UserAdded,
        UserNotAdded,
        UserRolledBack,
        ProfileAdded,
        ProfileNotAdded,
        ProfileRolledBack,
        ProfileCancelled,
        MailSent,
        MailFailed,
        MailCancelled,
        CompensationFailed,
    }
}

/// Schema marker for the CreateUser saga.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateUser;

impl SagaSchema for CreateUser {
    type Entity = User;
    type CommandType = UserCommandType;
    type ReplyType = UserReplyType;

    const NAME: &'static str = "CreateUser";
    const COMMAND_TOPIC: &'static str = CREATE_USER_COMMAND_TOPIC;
    const REPLY_TOPIC: &'static str = CREATE_USER_REPLY_TOPIC;
}

pub type CreateUserCommand = message::Command<CreateUser>;
pub type CreateUserReply = message::Reply<CreateUser>;
