//! Saga instance aggregate.

use chrono::{DateTime, Utc};
use common::{EntityId, SagaId};
use domain::Aggregate;
use saga_store::{StoredEvent, Version};
use serde::Serialize;

use crate::error::{Result, SagaError};
use crate::events::SagaEvent;
use crate::state::SagaState;

/// The command a saga is waiting on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AwaitingStep {
    pub step: String,
    pub attempt: u32,
    pub compensating: bool,
    pub since: DateTime<Utc>,
}

/// A step failure waiting to be reported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepFailure {
    pub step: String,
    pub reason: String,
}

/// An event-sourced saga instance.
///
/// This is the persisted saga record: which step is in flight, which steps
/// committed, what is left to compensate and the latest entity snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SagaInstance {
    id: SagaId,
    version: Version,
    saga_type: String,
    entity_id: EntityId,
    parent_id: Option<SagaId>,
    state: SagaState,
    awaiting: Option<AwaitingStep>,
    completed_steps: Vec<String>,
    /// Compensating commands not issued yet.
    compensation_plan: Vec<String>,
    compensated_steps: Vec<String>,
    entity: serde_json::Value,
    /// Child saga currently running a step on this saga's behalf.
    delegated_to: Option<SagaId>,
    delegated_type: Option<String>,
    /// Set when a child's cleanup failed; ends the saga in
    /// `CompensationFailed` once its own rollbacks are done.
    deferred_escalation: Option<StepFailure>,
    failure_reason: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl SagaInstance {
    fn empty(id: SagaId) -> Self {
        Self {
            id,
            version: Version::initial(),
            saga_type: String::new(),
            entity_id: EntityId::default(),
            parent_id: None,
            state: SagaState::NotStarted,
            awaiting: None,
            completed_steps: Vec::new(),
            compensation_plan: Vec::new(),
            compensated_steps: Vec::new(),
            entity: serde_json::Value::Null,
            delegated_to: None,
            delegated_type: None,
            deferred_escalation: None,
            failure_reason: None,
            created_at: DateTime::<Utc>::MIN_UTC,
            updated_at: DateTime::<Utc>::MIN_UTC,
        }
    }

    /// Rebuilds an instance from its log. Returns None for an empty log.
    pub fn from_log(saga_id: SagaId, log: &[StoredEvent]) -> Result<Option<Self>> {
        if log.is_empty() {
            return Ok(None);
        }
        let mut saga = Self::empty(saga_id);
        for stored in log {
            let event: SagaEvent = stored.decode()?;
            saga.apply(event);
            saga.set_version(stored.version);
        }
        if saga.state == SagaState::NotStarted {
            return Err(SagaError::corrupt(saga_id, "log does not begin with SagaStarted"));
        }
        Ok(Some(saga))
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn entity_id(&self) -> &EntityId {
        &self.entity_id
    }

    pub fn parent_id(&self) -> Option<SagaId> {
        self.parent_id
    }

    pub fn state(&self) -> SagaState {
        self.state
    }

    pub fn awaiting(&self) -> Option<&AwaitingStep> {
        self.awaiting.as_ref()
    }

    /// True if the saga waits on a reply for `step`.
    pub fn is_awaiting(&self, step: &str) -> bool {
        self.awaiting.as_ref().is_some_and(|a| a.step == step)
    }

    pub fn completed_steps(&self) -> &[String] {
        &self.completed_steps
    }

    pub fn compensation_plan(&self) -> &[String] {
        &self.compensation_plan
    }

    pub fn compensated_steps(&self) -> &[String] {
        &self.compensated_steps
    }

    pub fn entity(&self) -> &serde_json::Value {
        &self.entity
    }

    pub fn delegated_to(&self) -> Option<SagaId> {
        self.delegated_to
    }

    /// Saga kind of the child in `delegated_to`.
    pub fn delegated_type(&self) -> Option<&str> {
        self.delegated_type.as_deref()
    }

    pub fn deferred_escalation(&self) -> Option<&StepFailure> {
        self.deferred_escalation.as_ref()
    }

    pub fn failure_reason(&self) -> Option<&str> {
        self.failure_reason.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl Aggregate for SagaInstance {
    type Event = SagaEvent;

    fn aggregate_type(&self) -> &str {
        &self.saga_type
    }

    fn id(&self) -> SagaId {
        self.id
    }

    fn version(&self) -> Version {
        self.version
    }

    fn set_version(&mut self, version: Version) {
        self.version = version;
    }

    fn apply(&mut self, event: Self::Event) {
        self.updated_at = event.occurred_at();
        match event {
            SagaEvent::SagaStarted(data) => {
                self.id = data.saga_id;
                self.saga_type = data.saga_type;
                self.entity_id = data.entity_id;
                self.parent_id = data.parent_id;
                self.entity = data.entity;
                self.created_at = data.started_at;
                self.state = SagaState::Running;
            }
            SagaEvent::CommandIssued(data) => {
                if data.compensating
                    && self.compensation_plan.first().is_some_and(|c| *c == data.step)
                {
                    self.compensation_plan.remove(0);
                }
                self.awaiting = Some(AwaitingStep {
                    step: data.step,
                    attempt: data.attempt,
                    compensating: data.compensating,
                    since: data.issued_at,
                });
            }
            SagaEvent::StepCompleted(data) => {
                if !self.completed_steps.contains(&data.step) {
                    self.completed_steps.push(data.step);
                }
                self.entity = data.entity;
                self.awaiting = None;
                self.delegated_to = None;
                self.delegated_type = None;
            }
            SagaEvent::StepFailed(data) => {
                self.failure_reason = Some(format!("{}: {}", data.step, data.reason));
                self.awaiting = None;
                self.delegated_to = None;
                self.delegated_type = None;
            }
            SagaEvent::CompensationPlanned(data) => {
                self.state = SagaState::Compensating;
                self.compensation_plan = data.plan;
            }
            SagaEvent::CompensationStepCompleted(data) => {
                self.compensated_steps.push(data.step);
                self.awaiting = None;
            }
            SagaEvent::ChildSagaStarted(data) => {
                self.delegated_to = Some(data.child_id);
                self.delegated_type = Some(data.child_type);
                self.awaiting = Some(AwaitingStep {
                    step: data.step,
                    attempt: 1,
                    compensating: false,
                    since: data.at,
                });
            }
            SagaEvent::EscalationDeferred(data) => {
                self.deferred_escalation = Some(StepFailure {
                    step: data.step,
                    reason: data.reason,
                });
            }
            SagaEvent::SagaCompleted(_) => {
                self.state = SagaState::Completed;
                self.awaiting = None;
            }
            SagaEvent::SagaFailed(data) => {
                self.state = SagaState::Failed;
                self.awaiting = None;
                if self.failure_reason.is_none() {
                    self.failure_reason = Some(data.reason);
                }
            }
            SagaEvent::SagaCompensationFailed(data) => {
                self.state = SagaState::CompensationFailed;
                self.awaiting = None;
                self.failure_reason = Some(format!("{}: {}", data.step, data.reason));
            }
        }
    }
}
