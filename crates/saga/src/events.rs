//! Saga log events.
//!
//! Steps and reply types are stored by name so that one log format serves
//! every saga kind; the owning definition parses them back.

use chrono::{DateTime, Utc};
use common::{EntityId, SagaId};
use domain::DomainEvent;
use serde::{Deserialize, Serialize};

/// Event types after which a saga accepts no more replies.
pub const TERMINAL_EVENT_TYPES: &[&str] =
    &["SagaCompleted", "SagaFailed", "SagaCompensationFailed"];

/// Events recorded while a saga instance runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum SagaEvent {
    /// The instance was created.
    SagaStarted(SagaStartedData),

    /// A command was recorded as issued; the saga now awaits its reply.
    CommandIssued(CommandIssuedData),

    /// A forward step succeeded.
    StepCompleted(StepCompletedData),

    /// A forward step failed or timed out.
    StepFailed(StepFailedData),

    /// The compensating commands still to issue, in order.
    CompensationPlanned(CompensationPlannedData),

    /// A compensating command was acknowledged.
    CompensationStepCompleted(StepData),

    /// A forward step was handed to a linked child saga.
    ChildSagaStarted(ChildSagaData),

    /// A child saga could not undo its own work. The parent still rolls
    /// back its committed steps, then ends in `SagaCompensationFailed`.
    EscalationDeferred(StepFailedData),

    SagaCompleted(SagaCompletedData),

    /// Compensation finished.
    SagaFailed(SagaFailedData),

    /// A compensating command failed; the saga stops here.
    SagaCompensationFailed(StepFailedData),
}

impl DomainEvent for SagaEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SagaEvent::SagaStarted(_) => "SagaStarted",
            SagaEvent::CommandIssued(_) => "CommandIssued",
            SagaEvent::StepCompleted(_) => "StepCompleted",
            SagaEvent::StepFailed(_) => "StepFailed",
            SagaEvent::CompensationPlanned(_) => "CompensationPlanned",
            SagaEvent::CompensationStepCompleted(_) => "CompensationStepCompleted",
            SagaEvent::ChildSagaStarted(_) => "ChildSagaStarted",
            SagaEvent::EscalationDeferred(_) => "EscalationDeferred",
            SagaEvent::SagaCompleted(_) => "SagaCompleted",
            SagaEvent::SagaFailed(_) => "SagaFailed",
            SagaEvent::SagaCompensationFailed(_) => "SagaCompensationFailed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaStartedData {
    pub saga_id: SagaId,
    /// Saga kind, e.g. "CreateUser" or "CreateAvailability".
    pub saga_type: String,
    pub entity_id: EntityId,
    /// Set for child sagas.
    pub parent_id: Option<SagaId>,
    /// Entity snapshot at start.
    pub entity: serde_json::Value,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandIssuedData {
    pub step: String,
    /// 1 for the first publication; the watchdog increments it on retry.
    pub attempt: u32,
    pub compensating: bool,
    pub issued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepData {
    pub step: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepCompletedData {
    pub step: String,
    /// Reply type that completed the step.
    pub reply: String,
    /// Entity snapshot returned by the participant.
    pub entity: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepFailedData {
    pub step: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompensationPlannedData {
    pub plan: Vec<String>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSagaData {
    pub child_id: SagaId,
    pub child_type: String,
    /// The child's first command; the parent awaits its relayed outcome.
    pub step: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaCompletedData {
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaFailedData {
    pub reason: String,
    pub failed_at: DateTime<Utc>,
}

// Convenience constructors
impl SagaEvent {
    pub fn saga_started(
        saga_id: SagaId,
        saga_type: impl Into<String>,
        entity_id: EntityId,
        parent_id: Option<SagaId>,
        entity: serde_json::Value,
    ) -> Self {
        SagaEvent::SagaStarted(SagaStartedData {
            saga_id,
            saga_type: saga_type.into(),
            entity_id,
            parent_id,
            entity,
            started_at: Utc::now(),
        })
    }

    pub fn command_issued(step: impl Into<String>, attempt: u32, compensating: bool) -> Self {
        SagaEvent::CommandIssued(CommandIssuedData {
            step: step.into(),
            attempt,
            compensating,
            issued_at: Utc::now(),
        })
    }

    pub fn step_completed(
        step: impl Into<String>,
        reply: impl Into<String>,
        entity: serde_json::Value,
    ) -> Self {
        SagaEvent::StepCompleted(StepCompletedData {
            step: step.into(),
            reply: reply.into(),
            entity,
            at: Utc::now(),
        })
    }

    pub fn step_failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaEvent::StepFailed(StepFailedData {
            step: step.into(),
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn compensation_planned(plan: Vec<String>) -> Self {
        SagaEvent::CompensationPlanned(CompensationPlannedData {
            plan,
            at: Utc::now(),
        })
    }

    pub fn compensation_step_completed(step: impl Into<String>) -> Self {
        SagaEvent::CompensationStepCompleted(StepData {
            step: step.into(),
            at: Utc::now(),
        })
    }

    pub fn child_saga_started(
        child_id: SagaId,
        child_type: impl Into<String>,
        step: impl Into<String>,
    ) -> Self {
        SagaEvent::ChildSagaStarted(ChildSagaData {
            child_id,
            child_type: child_type.into(),
            step: step.into(),
            at: Utc::now(),
        })
    }

    pub fn escalation_deferred(step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaEvent::EscalationDeferred(StepFailedData {
            step: step.into(),
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn saga_completed() -> Self {
        SagaEvent::SagaCompleted(SagaCompletedData {
            completed_at: Utc::now(),
        })
    }

    pub fn saga_failed(reason: impl Into<String>) -> Self {
        SagaEvent::SagaFailed(SagaFailedData {
            reason: reason.into(),
            failed_at: Utc::now(),
        })
    }

    pub fn compensation_failed(step: impl Into<String>, reason: impl Into<String>) -> Self {
        SagaEvent::SagaCompensationFailed(StepFailedData {
            step: step.into(),
            reason: reason.into(),
            at: Utc::now(),
        })
    }

    pub fn is_terminal(&self) -> bool {
        TERMINAL_EVENT_TYPES.contains(&self.event_type())
    }

    /// When the event happened.
    pub fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SagaEvent::SagaStarted(d) => d.started_at,
            SagaEvent::CommandIssued(d) => d.issued_at,
            SagaEvent::StepCompleted(d) => d.at,
            SagaEvent::StepFailed(d)
            | SagaEvent::EscalationDeferred(d)
            | SagaEvent::SagaCompensationFailed(d) => d.at,
            SagaEvent::CompensationPlanned(d) => d.at,
            SagaEvent::CompensationStepCompleted(d) => d.at,
            SagaEvent::ChildSagaStarted(d) => d.at,
            SagaEvent::SagaCompleted(d) => d.completed_at,
            SagaEvent::SagaFailed(d) => d.failed_at,
        }
    }
}
