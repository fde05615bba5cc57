//! Notification service: welcome mails.

use std::collections::HashSet;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use common::EntityId;
use domain::{CreateUser, User, UserCommandType, UserReplyType};

use crate::error::EffectError;
use crate::participant::{Participant, Route};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mail {
    pub user_id: EntityId,
    pub to: String,
    pub subject: String,
}

#[derive(Debug, Default)]
struct MailerState {
    outbox: Vec<Mail>,
    cancelled: HashSet<EntityId>,
    fail_on_send: bool,
    fail_on_cancel: bool,
}

/// In-memory mailer with an outbox.
#[derive(Debug, Clone, Default)]
pub struct Mailer {
    state: Arc<RwLock<MailerState>>,
}

impl Mailer {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, MailerState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, MailerState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_on_send(&self, fail: bool) {
        self.write().fail_on_send = fail;
    }

    pub fn set_fail_on_cancel(&self, fail: bool) {
        self.write().fail_on_cancel = fail;
    }

    pub fn outbox(&self) -> Vec<Mail> {
        self.read().outbox.clone()
    }

    pub fn sent_count(&self) -> usize {
        self.read().outbox.len()
    }

    fn send(&self, user: &User) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_send {
            return Err(EffectError::rejected(format!(
                "mail relay refused {}",
                user.email
            )));
        }
        if state.cancelled.contains(&user.id) {
            return Err(EffectError::cancelled(&user.id, "SendMail"));
        }
        state.outbox.push(Mail {
            user_id: user.id.clone(),
            to: user.email.clone(),
            subject: format!("Welcome, {}", user.username),
        });
        Ok(())
    }

    fn cancel(&self, user: &User) -> Result<(), EffectError> {
        let mut state = self.write();
        if state.fail_on_cancel {
            return Err(EffectError::rejected("mail relay unavailable"));
        }
        state.outbox.retain(|m| m.user_id != user.id);
        state.cancelled.insert(user.id.clone());
        Ok(())
    }
}

#[async_trait]
impl Participant<CreateUser> for Mailer {
    fn name(&self) -> &'static str {
        "mailer"
    }

    fn route(&self, command: UserCommandType) -> Option<Route<UserReplyType>> {
        use UserCommandType as C;
        use UserReplyType as R;

        match command {
            C::SendMail => Some(Route::forward(R::MailSent, R::MailFailed)),
            C::CancelMail => Some(Route::compensating(R::MailCancelled, R::CompensationFailed)),
            C::AddUser
            | C::RollbackUser
            | C::AddProfile
            | C::CancelProfile
            | C::RollbackProfile
            | C::Unknown => None,
        }
    }

    async fn apply(
        &self,
        command: UserCommandType,
        user: &User,
    ) -> Result<Option<User>, EffectError> {
        match command {
            UserCommandType::SendMail => self.send(user)?,
            UserCommandType::CancelMail => self.cancel(user)?,
            other => return Err(EffectError::rejected(format!("mailer cannot {other}"))),
        }
        Ok(None)
    }
}
