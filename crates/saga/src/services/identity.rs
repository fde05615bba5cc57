//! Identity service: owns user accounts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::EntityId;
use domain::{CreateUser, User, UserCommandType, UserReplyType};

use crate::error::EffectError;
use crate::participant::{Participant, Route};

#[derive(Debug, Default)]
struct IdentityState {
    users: HashMap<EntityId, User>,
    rolled_back: HashSet<EntityId>,
    fail_on_add: bool,
    fail_on_rollback: bool,
}

/// In-memory identity store.
#[derive(Debug, Clone, Default)]
pub struct IdentityStore {
    state: Arc<RwLock<IdentityState>>,
}

impl IdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, IdentityState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, IdentityState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every `AddUser` fail.
    pub fn set_fail_on_add(&self, fail: bool) {
        self.write().fail_on_add = fail;
    }

    /// Makes every `RollbackUser` fail.
    pub fn set_fail_on_rollback(&self, fail: bool) {
        self.write().fail_on_rollback = fail;
    }

    pub fn user_count(&self) -> usize {
        self.read().users.len()
    }

    pub fn has_user(&self, id: &EntityId) -> bool {
        self.read().users.contains_key(id)
    }

    pub fn find_by_username(&self, username: &str) -> Option<User> {
        self.read()
            .users
            .values()
            .find(|u| u.username == username)
            .cloned()
    }

    fn add(&self, user: &User) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_add {
            return Err(EffectError::rejected(format!(
                "identity store refused {}",
                user.username
            )));
        }
        if state.rolled_back.contains(&user.id) {
            return Err(EffectError::cancelled(&user.id, "AddUser"));
        }
        if state
            .users
            .values()
            .any(|u| u.username == user.username && u.id != user.id)
        {
            return Err(EffectError::Duplicate(format!("username {}", user.username)));
        }
        state.users.insert(user.id.clone(), user.clone());
        Ok(())
    }

    fn rollback(&self, user: &User) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_rollback {
            return Err(EffectError::rejected("identity store unavailable"));
        }
        state.users.remove(&user.id);
        state.rolled_back.insert(user.id.clone());
        Ok(())
    }
}

#[async_trait]
impl Participant<CreateUser> for IdentityStore {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn route(&self, command: UserCommandType) -> Option<Route<UserReplyType>> {
        use UserCommandType as C;

        match command {
            C::AddUser => Some(Route::forward(
                UserReplyType::UserAdded,
                UserReplyType::UserNotAdded,
            )),
            C::RollbackUser => Some(Route::compensating(
                UserReplyType::UserRolledBack,
                UserReplyType::CompensationFailed,
            )),
            C::AddProfile
            | C::CancelProfile
            | C::RollbackProfile
            | C::SendMail
            | C::CancelMail
            | C::Unknown => None,
        }
    }

    async fn apply(
        &self,
        command: UserCommandType,
        user: &User,
    ) -> Result<Option<User>, EffectError> {
        match command {
            UserCommandType::AddUser => self.add(user)?,
            UserCommandType::RollbackUser => self.rollback(user)?,
            other => return Err(EffectError::rejected(format!("identity cannot {other}"))),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Role;

    fn user(name: &str) -> User {
        User::new(name, format!("{name}@example.com"), Role::Guest)
    }

    #[tokio::test]
    async fn test_add_and_rollback() {
        let store = IdentityStore::new();
        let u = user("ana");

        store.apply(UserCommandType::AddUser, &u).await.unwrap();
        assert!(store.has_user(&u.id));
        assert_eq!(store.find_by_username("ana").map(|f| f.id), Some(u.id.clone()));

        store.apply(UserCommandType::RollbackUser, &u).await.unwrap();
        assert_eq!(store.user_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_refuses_late_add() {
        let store = IdentityStore::new();
        let u = user("ana");

        store.apply(UserCommandType::RollbackUser, &u).await.unwrap();
        let err = store.apply(UserCommandType::AddUser, &u).await.unwrap_err();
        assert!(matches!(err, EffectError::Cancelled { .. }));
        assert_eq!(store.user_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_username() {
        let store = IdentityStore::new();
        store.apply(UserCommandType::AddUser, &user("ana")).await.unwrap();

        let err = store
            .apply(UserCommandType::AddUser, &user("ana"))
            .await
            .unwrap_err();
        assert!(matches!(err, EffectError::Duplicate(_)));
    }

    #[tokio::test]
    async fn test_fail_on_add() {
        let store = IdentityStore::new();
        store.set_fail_on_add(true);
        assert!(store.apply(UserCommandType::AddUser, &user("ana")).await.is_err());
        assert_eq!(store.user_count(), 0);
    }

    #[test]
    fn test_routes_only_identity_commands() {
        let store = IdentityStore::new();
        assert!(store.route(UserCommandType::AddUser).is_some());
        assert!(store.route(UserCommandType::RollbackUser).unwrap().compensating);
        assert!(store.route(UserCommandType::AddProfile).is_none());
        assert!(store.route(UserCommandType::Unknown).is_none());
    }
}
