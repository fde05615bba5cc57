//! CreateUser saga definition.
//!
//! Steps, in order:
//! 1. `AddUser` (identity store), undone by `RollbackUser`
//! 2. `AddProfile` (profile store), undone by `RollbackProfile`
//! 3. `SendMail` (mailer)

use domain::{CreateUser, User, UserCommandType, UserReplyType};

use crate::definition::{SagaDefinition, Transition};

/// Saga type name stored in the log.
pub const SAGA_TYPE: &str = "CreateUser";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserSagaKind {
    CreateUser,
}

/// The CreateUser transition table.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreateUserSaga;

impl SagaDefinition for CreateUserSaga {
    type Schema = CreateUser;
    type Kind = UserSagaKind;

    const ROOT: UserSagaKind = UserSagaKind::CreateUser;
    const KINDS: &'static [UserSagaKind] = &[UserSagaKind::CreateUser];

    fn kind_name(kind: UserSagaKind) -> &'static str {
        match kind {
            UserSagaKind::CreateUser => SAGA_TYPE,
        }
    }

    fn initial_command(kind: UserSagaKind) -> UserCommandType {
        match kind {
            UserSagaKind::CreateUser => UserCommandType::AddUser,
        }
    }

    fn transition(
        _kind: UserSagaKind,
        reply: UserReplyType,
        _entity: &User,
    ) -> Transition<UserSagaKind, UserCommandType> {
        use UserCommandType as C;
        use UserReplyType as R;

        match reply {
            R::UserAdded => Transition::Advance(C::AddProfile),
            R::UserNotAdded => Transition::Compensate(C::CancelProfile),
            R::ProfileAdded => Transition::Advance(C::SendMail),
            R::ProfileNotAdded => Transition::Compensate(C::RollbackUser),
            R::MailSent => Transition::Complete,
            R::MailFailed => Transition::Compensate(C::RollbackProfile),
            R::UserRolledBack | R::ProfileRolledBack | R::ProfileCancelled | R::MailCancelled => {
                Transition::Compensated
            }
            R::CompensationFailed => Transition::CompensationFailed,
            R::Unknown => Transition::Ignore,
        }
    }

    fn answers(step: UserCommandType) -> &'static [UserReplyType] {
        use UserCommandType as C;
        use UserReplyType as R;

        match step {
            C::AddUser => &[R::UserAdded, R::UserNotAdded],
            C::AddProfile => &[R::ProfileAdded, R::ProfileNotAdded],
            C::SendMail => &[R::MailSent, R::MailFailed],
            C::RollbackUser => &[R::UserRolledBack, R::CompensationFailed],
            C::CancelProfile => &[R::ProfileCancelled, R::CompensationFailed],
            C::RollbackProfile => &[R::ProfileRolledBack, R::CompensationFailed],
            C::CancelMail => &[R::MailCancelled, R::CompensationFailed],
            C::Unknown => &[],
        }
    }

    fn rollback(step: UserCommandType) -> Option<UserCommandType> {
        use UserCommandType as C;

        match step {
            C::AddUser => Some(C::RollbackUser),
            C::AddProfile => Some(C::RollbackProfile),
            C::SendMail => None,
            C::RollbackUser
            | C::CancelProfile
            | C::RollbackProfile
            | C::CancelMail
            | C::Unknown => None,
        }
    }

    fn cancel(step: UserCommandType) -> Option<UserCommandType> {
        use UserCommandType as C;

        match step {
            C::AddUser => Some(C::RollbackUser),
            C::AddProfile => Some(C::CancelProfile),
            C::SendMail => Some(C::CancelMail),
            C::RollbackUser
            | C::CancelProfile
            | C::RollbackProfile
            | C::CancelMail
            | C::Unknown => None,
        }
    }
}
