//! Profile service: personal details shown on a user's page.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::EntityId;
use domain::{CreateUser, User, UserCommandType, UserReplyType};

use crate::error::EffectError;
use crate::participant::{Participant, Route};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub display_name: String,
    pub city: String,
}

#[derive(Debug, Default)]
struct ProfileState {
    profiles: HashMap<EntityId, Profile>,
    cancelled: HashSet<EntityId>,
    fail_on_add: bool,
    fail_on_compensate: bool,
}

/// In-memory profile store.
#[derive(Debug, Clone, Default)]
pub struct ProfileStore {
    state: Arc<RwLock<ProfileState>>,
}

impl ProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, ProfileState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProfileState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_on_add(&self, fail: bool) {
        self.write().fail_on_add = fail;
    }

    /// Makes `RollbackProfile` and `CancelProfile` fail.
    pub fn set_fail_on_compensate(&self, fail: bool) {
        self.write().fail_on_compensate = fail;
    }

    pub fn profile_count(&self) -> usize {
        self.read().profiles.len()
    }

    pub fn profile(&self, user_id: &EntityId) -> Option<Profile> {
        self.read().profiles.get(user_id).cloned()
    }

    pub fn is_cancelled(&self, user_id: &EntityId) -> bool {
        self.read().cancelled.contains(user_id)
    }

    fn add(&self, user: &User) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_add {
            return Err(EffectError::rejected("profile store refused the profile"));
        }
        if state.cancelled.contains(&user.id) {
            return Err(EffectError::cancelled(&user.id, "AddProfile"));
        }
        let display_name = format!("{} {}", user.first_name, user.last_name)
            .trim()
            .to_string();
        state.profiles.insert(
            user.id.clone(),
            Profile {
                display_name: if display_name.is_empty() {
                    user.username.clone()
                } else {
                    display_name
                },
                city: user.city.clone(),
            },
        );
        Ok(())
    }

    fn remove(&self, user: &User, tombstone: bool) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_compensate {
            return Err(EffectError::rejected("profile store unavailable"));
        }
        state.profiles.remove(&user.id);
        if tombstone {
            state.cancelled.insert(user.id.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl Participant<CreateUser> for ProfileStore {
    fn name(&self) -> &'static str {
        "profile"
    }

    fn route(&self, command: UserCommandType) -> Option<Route<UserReplyType>> {
        use UserCommandType as C;
        use UserReplyType as R;

        match command {
            C::AddProfile => Some(Route::forward(R::ProfileAdded, R::ProfileNotAdded)),
            C::RollbackProfile => Some(Route::compensating(
                R::ProfileRolledBack,
                R::CompensationFailed,
            )),
            C::CancelProfile => Some(Route::compensating(
                R::ProfileCancelled,
                R::CompensationFailed,
            )),
            C::AddUser | C::RollbackUser | C::SendMail | C::CancelMail | C::Unknown => None,
        }
    }

    async fn apply(
        &self,
        command: UserCommandType,
        user: &User,
    ) -> Result<Option<User>, EffectError> {
        match command {
            UserCommandType::AddProfile => self.add(user)?,
            UserCommandType::RollbackProfile => self.remove(user, false)?,
            UserCommandType::CancelProfile => self.remove(user, true)?,
            other => return Err(EffectError::rejected(format!("profile cannot {other}"))),
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::Role;

    fn user() -> User {
        User::new("ana", "ana@example.com", Role::Host)
            .with_name("Ana", "Ruiz")
            .with_city("Porto")
    }

    #[tokio::test]
    async fn test_add_profile() {
        let store = ProfileStore::new();
        let u = user();
        store.apply(UserCommandType::AddProfile, &u).await.unwrap();

        let profile = store.profile(&u.id).unwrap();
        assert_eq!(profile.display_name, "Ana Ruiz");
        assert_eq!(profile.city, "Porto");
    }

    #[tokio::test]
    async fn test_display_name_falls_back_to_username() {
        let store = ProfileStore::new();
        let u = User::new("ana", "ana@example.com", Role::Guest);
        store.apply(UserCommandType::AddProfile, &u).await.unwrap();
        assert_eq!(store.profile(&u.id).unwrap().display_name, "ana");
    }

    #[tokio::test]
    async fn test_cancel_blocks_later_add() {
        let store = ProfileStore::new();
        let u = user();

        store.apply(UserCommandType::CancelProfile, &u).await.unwrap();
        assert!(store.is_cancelled(&u.id));

        let err = store.apply(UserCommandType::AddProfile, &u).await.unwrap_err();
        assert!(matches!(err, EffectError::Cancelled { .. }));
        assert_eq!(store.profile_count(), 0);
    }

    #[tokio::test]
    async fn test_rollback_removes_profile() {
        let store = ProfileStore::new();
        let u = user();
        store.apply(UserCommandType::AddProfile, &u).await.unwrap();
        store.apply(UserCommandType::RollbackProfile, &u).await.unwrap();
        assert_eq!(store.profile_count(), 0);
        assert!(!store.is_cancelled(&u.id));
    }

    #[tokio::test]
    async fn test_fail_on_compensate() {
        let store = ProfileStore::new();
        store.set_fail_on_compensate(true);
        assert!(store.apply(UserCommandType::RollbackProfile, &user()).await.is_err());
    }
}
