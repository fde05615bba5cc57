//! Bearer token resolution for authenticated endpoints.

use std::collections::HashMap;

use common::EntityId;
use domain::Role;
use thiserror::Error;

/// The caller behind a bearer token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: EntityId,
    pub role: Role,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum IdentityError {
    #[error("missing bearer token")]
    MissingToken,

    #[error("unknown bearer token")]
    UnknownToken,

    #[error("malformed token grant: {0}")]
    MalformedGrant(String),
}

/// Maps a bearer token to the identity it was issued to.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Result<Identity, IdentityError>;
}

/// A fixed token table, loaded at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticTokenResolver {
    tokens: HashMap<String, Identity>,
}

impl StaticTokenResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(
        mut self,
        token: impl Into<String>,
        user_id: impl Into<EntityId>,
        role: Role,
    ) -> Self {
        self.tokens.insert(
            token.into(),
            Identity {
                user_id: user_id.into(),
                role,
            },
        );
        self
    }

    /// Parses grants of the form `token=user_id:Role`, separated by commas.
    pub fn parse(grants: &str) -> Result<Self, IdentityError> {
        let mut resolver = Self::new();
        for grant in grants.split(',').map(str::trim).filter(|g| !g.is_empty()) {
            let malformed = || IdentityError::MalformedGrant(grant.to_string());
            let (token, rest) = grant.split_once('=').ok_or_else(malformed)?;
            let (user_id, role) = rest.split_once(':').ok_or_else(malformed)?;
            let role = match role.trim() {
                "Host" => Role::Host,
                "Guest" => Role::Guest,
                _ => return Err(malformed()),
            };
            if token.trim().is_empty() || user_id.trim().is_empty() {
                return Err(malformed());
            }
            resolver = resolver.with_token(token.trim(), user_id.trim(), role);
        }
        Ok(resolver)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl IdentityResolver for StaticTokenResolver {
    fn resolve(&self, token: &str) -> Result<Identity, IdentityError> {
        if token.is_empty() {
            return Err(IdentityError::MissingToken);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(IdentityError::UnknownToken)
    }
}
