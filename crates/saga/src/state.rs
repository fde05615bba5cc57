//! Saga state machine.

use serde::{Deserialize, Serialize};

/// The state of a saga in its lifecycle.
///
/// State transitions:
/// ```text
/// NotStarted ──► Running ──┬──► Completed
///                          └──► Compensating ──┬──► Failed
///                                              └──► CompensationFailed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum SagaState {
    /// No event applied yet.
    #[default]
    NotStarted,

    /// Forward commands are being issued.
    Running,

    /// A step failed and compensating commands are being issued.
    Compensating,

    /// Every forward step succeeded (terminal state).
    Completed,

    /// Every committed step was compensated (terminal state).
    Failed,

    /// A compensating command failed; needs an operator (terminal state).
    CompensationFailed,
}

impl SagaState {
    /// Returns true if forward replies are still accepted.
    pub fn can_run(&self) -> bool {
        matches!(self, SagaState::Running)
    }

    /// Returns true if the saga can begin compensation.
    pub fn can_compensate(&self) -> bool {
        matches!(self, SagaState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SagaState::Completed | SagaState::Failed | SagaState::CompensationFailed
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SagaState::NotStarted => "NotStarted",
            SagaState::Running => "Running",
            SagaState::Compensating => "Compensating",
            SagaState::Completed => "Completed",
            SagaState::Failed => "Failed",
            SagaState::CompensationFailed => "CompensationFailed",
        }
    }
}

impl std::fmt::Display for SagaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
