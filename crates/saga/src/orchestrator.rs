//! The saga orchestrator.
//!
//! [`Orchestrator::handle`] is the only place a running saga changes. Each
//! reply is checked against the step the saga awaits, turned into log events
//! by the definition's transition table and appended with an expected
//! version. Commands, child sagas, relays to a parent and alerts go out only
//! after that append commits, so a lost race never leaks a side effect.

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{
    Consumer, Envelope, HandlerError, MessageBus, MessageBusExt, RetryPolicy, publish_with_retry,
};
use chrono::{DateTime, TimeDelta, Utc};
use common::SagaId;
use domain::{Aggregate, Command, DomainEvent, MessageType, Reply, SagaEntity, SagaSchema};
use saga_store::{AppendOptions, SagaStore, SagaStoreExt, StoredEvent, Version};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::aggregate::{AwaitingStep, SagaInstance};
use crate::alert::{Alert, AlertSink, LogAlertSink};
use crate::definition::{
    CommandOf, EntityOf, Outcome, SagaDefinition, Transition, compensation_plan, parse_steps,
};
use crate::error::{Result, SagaError};
use crate::events::{SagaEvent, TERMINAL_EVENT_TYPES};
use crate::state::SagaState;

/// Shortest watchdog period; `tokio::time::interval` panics on zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);

/// Timing and retry settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a step may go without a reply before the watchdog acts.
    pub step_timeout: Duration,
    /// Publications of one command, the first included, before giving up.
    pub max_attempts: u32,
    pub publish_retry: RetryPolicy,
    /// Reloads after losing an optimistic-concurrency race.
    pub max_conflict_retries: u32,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            max_attempts: 3,
            publish_retry: RetryPolicy::default(),
            max_conflict_retries: 5,
        }
    }
}

impl OrchestratorConfig {
    /// Sets how long a step may stay silent before the watchdog acts.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Sets how often a command is published before the step is abandoned.
    /// Values below one count as one.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Backoff for transient bus errors while publishing.
    pub fn with_publish_retry(mut self, policy: RetryPolicy) -> Self {
        self.publish_retry = policy;
        self
    }
}

/// What [`Orchestrator::handle`] did with a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The reply advanced, completed or compensated the saga.
    Applied,
    /// The saga was not awaiting this reply (redelivery or late reply).
    Duplicate,
    /// The reply type has no transition from the current step.
    Ignored,
    UnknownSaga,
}

/// Counts of watchdog actions in one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Commands republished with a higher attempt number.
    pub retried: usize,
    /// Forward steps given up on; compensation started.
    pub compensated: usize,
    /// Compensating steps given up on; an alert was raised.
    pub escalated: usize,
    /// Finished children whose outcome was sent to their parent again.
    pub relayed: usize,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.retried == 0 && self.compensated == 0 && self.escalated == 0 && self.relayed == 0
    }
}

/// Work that runs after the saga's events are committed.
enum Effect<D: SagaDefinition> {
    Publish { command: CommandOf<D>, attempt: u32 },
    StartChild { child_id: SagaId, kind: D::Kind },
    Relay { parent_id: SagaId, outcome: Outcome },
    Alert { step: String, reason: String },
}

/// Events to append plus what to do once they are stored.
struct Plan<D: SagaDefinition> {
    events: Vec<SagaEvent>,
    effects: Vec<Effect<D>>,
}

impl<D: SagaDefinition> Plan<D> {
    fn new() -> Self {
        Self {
            events: Vec::new(),
            effects: Vec::new(),
        }
    }

    fn event(mut self, event: SagaEvent) -> Self {
        self.events.push(event);
        self
    }

    fn effect(mut self, effect: Effect<D>) -> Self {
        self.effects.push(effect);
        self
    }

    fn relay_to(self, parent_id: Option<SagaId>, outcome: Outcome) -> Self {
        match parent_id {
            Some(parent_id) => self.effect(Effect::Relay { parent_id, outcome }),
            None => self,
        }
    }
}

/// Drives every saga kind of definition `D`.
pub struct Orchestrator<D, S, B> {
    store: Arc<S>,
    bus: Arc<B>,
    alerts: Arc<dyn AlertSink>,
    config: OrchestratorConfig,
    _definition: PhantomData<fn() -> D>,
}

impl<D, S, B> Clone for Orchestrator<D, S, B> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            bus: self.bus.clone(),
            alerts: self.alerts.clone(),
            config: self.config.clone(),
            _definition: PhantomData,
        }
    }
}

impl<D, S, B> Orchestrator<D, S, B>
where
    D: SagaDefinition,
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    pub fn new(store: Arc<S>, bus: Arc<B>) -> Self {
        Self {
            store,
            bus,
            alerts: Arc::new(LogAlertSink),
            config: OrchestratorConfig::default(),
            _definition: PhantomData,
        }
    }

    pub fn with_config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    /// Routes compensation failures to `alerts` instead of the log.
    pub fn with_alert_sink(mut self, alerts: Arc<dyn AlertSink>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Starts a root saga for `entity` and publishes its first command.
    #[tracing::instrument(
        skip(self, entity),
        fields(saga_type = D::kind_name(D::ROOT), entity_id = %entity.entity_id())
    )]
    pub async fn start(&self, entity: EntityOf<D>) -> Result<SagaId> {
        entity.validate()?;
        let saga_id = SagaId::new();
        self.start_kind(saga_id, D::ROOT, entity, None).await?;
        Ok(saga_id)
    }

    async fn start_kind(
        &self,
        saga_id: SagaId,
        kind: D::Kind,
        entity: EntityOf<D>,
        parent_id: Option<SagaId>,
    ) -> Result<()> {
        let saga_type = D::kind_name(kind);
        let first = D::initial_command(kind);
        let events = [
            SagaEvent::saga_started(
                saga_id,
                saga_type,
                entity.entity_id().clone(),
                parent_id,
                serde_json::to_value(&entity)?,
            ),
            SagaEvent::command_issued(first.as_str(), 1, false),
        ];
        self.append(saga_id, saga_type, Version::initial(), &events)
            .await?;

        metrics::counter!("saga_started_total", "saga_type" => saga_type).increment(1);
        tracing::info!(%saga_id, saga_type, parent_id = ?parent_id, step = %first, "saga started");

        self.publish_command(saga_id, first, entity, 1).await
    }

    /// Applies one reply. Safe to call concurrently and repeatedly with the
    /// same reply.
    #[tracing::instrument(
        skip(self, reply),
        fields(saga_id = %reply.saga_id(), reply = %reply.kind, in_reply_to = %reply.in_reply_to)
    )]
    pub async fn handle(&self, reply: Reply<D::Schema>) -> Result<HandleOutcome> {
        let saga_id = reply.saga_id();
        let attempts = self.config.max_conflict_retries.max(1);
        for attempt in 1..=attempts {
            match self.try_handle(&reply).await {
                Err(e) if e.is_conflict() => {
                    tracing::debug!(attempt, "lost race on saga log, reloading");
                }
                other => return other,
            }
        }
        Err(SagaError::Contended { saga_id, attempts })
    }

    async fn try_handle(&self, reply: &Reply<D::Schema>) -> Result<HandleOutcome> {
        let saga_id = reply.saga_id();
        let Some(saga) = self.load(saga_id).await? else {
            tracing::warn!("reply for unknown saga");
            metrics::counter!("saga_unknown_replies_total").increment(1);
            return Ok(HandleOutcome::UnknownSaga);
        };

        let step = reply.in_reply_to.as_str();
        let awaiting = match saga.awaiting() {
            Some(a) if !saga.state().is_terminal() && a.step == step => a.clone(),
            _ => {
                tracing::debug!(state = %saga.state(), "saga is not awaiting this reply");
                metrics::counter!("saga_duplicate_replies_total", "saga_type" => saga.saga_type().to_string())
                    .increment(1);
                return Ok(HandleOutcome::Duplicate);
            }
        };

        let kind = kind_of::<D>(&saga)?;
        let awaited = parse_step::<D>(saga_id, &awaiting.step)?;
        if !D::answers(awaited).contains(&reply.kind) {
            tracing::warn!(step = %awaited, "reply type does not answer the awaited step");
            metrics::counter!("saga_ignored_replies_total", "saga_type" => saga.saga_type().to_string())
                .increment(1);
            return Ok(HandleOutcome::Ignored);
        }

        let transition = D::transition(kind, reply.kind, &reply.payload);
        let Some(plan) = self.plan(&saga, kind, &awaiting, reply, transition)? else {
            tracing::warn!(?transition, compensating = awaiting.compensating, "reply ignored");
            metrics::counter!("saga_ignored_replies_total", "saga_type" => saga.saga_type().to_string())
                .increment(1);
            return Ok(HandleOutcome::Ignored);
        };

        self.commit(&saga, kind, plan, reply.payload.clone()).await?;
        Ok(HandleOutcome::Applied)
    }

    /// Turns a transition into events and effects. None means the reply
    /// does not fit the awaited step.
    fn plan(
        &self,
        saga: &SagaInstance,
        kind: D::Kind,
        awaiting: &AwaitingStep,
        reply: &Reply<D::Schema>,
        transition: Transition<D::Kind, CommandOf<D>>,
    ) -> Result<Option<Plan<D>>> {
        let step = awaiting.step.as_str();
        let reason = reply
            .reason
            .clone()
            .unwrap_or_else(|| reply.kind.as_str().to_string());
        let forward = !awaiting.compensating;

        let plan = match transition {
            Transition::Advance(next) if forward => Plan::new()
                .event(self.step_completed(step, reply)?)
                .event(SagaEvent::command_issued(next.as_str(), 1, false))
                .effect(Effect::Publish {
                    command: next,
                    attempt: 1,
                }),
            Transition::SubSaga {
                kind: child_kind,
                command,
            } if forward => {
                let child_id = SagaId::new();
                Plan::new()
                    .event(self.step_completed(step, reply)?)
                    .event(SagaEvent::child_saga_started(
                        child_id,
                        D::kind_name(child_kind),
                        command.as_str(),
                    ))
                    .effect(Effect::StartChild {
                        child_id,
                        kind: child_kind,
                    })
            }
            Transition::Complete if forward => Plan::new()
                .event(self.step_completed(step, reply)?)
                .event(SagaEvent::saga_completed())
                .relay_to(saga.parent_id(), Outcome::Completed),
            Transition::Compensate(first) if forward => {
                let committed = parse_steps::<D>(saga.completed_steps());
                let steps = compensation_plan::<D>(Some(first), &committed);
                Plan::new()
                    .event(SagaEvent::step_failed(step, reason))
                    .compensate(saga, steps)
            }
            Transition::Compensated if awaiting.compensating => {
                let plan = Plan::new().event(SagaEvent::compensation_step_completed(step));
                match saga.compensation_plan().first() {
                    Some(next) => {
                        let next = parse_step::<D>(saga.id(), next)?;
                        plan.event(SagaEvent::command_issued(next.as_str(), 1, true))
                            .effect(Effect::Publish {
                                command: next,
                                attempt: 1,
                            })
                    }
                    None => plan.fail(saga),
                }
            }
            Transition::CompensationFailed if forward => {
                // A child could not clean up after itself. Undo our own
                // committed steps before stopping for an operator.
                let committed = parse_steps::<D>(saga.completed_steps());
                let steps = compensation_plan::<D>(None, &committed);
                let plan = Plan::new()
                    .event(SagaEvent::step_failed(step, reason.clone()))
                    .event(SagaEvent::escalation_deferred(step, reason.clone()));
                if steps.is_empty() {
                    plan.escalate(saga, step, reason)
                } else {
                    plan.compensate(saga, steps)
                }
            }
            Transition::CompensationFailed => Plan::new().escalate(saga, step, reason),
            _ => return Ok(None),
        };
        Ok(Some(plan))
    }

    fn step_completed(&self, step: &str, reply: &Reply<D::Schema>) -> Result<SagaEvent> {
        Ok(SagaEvent::step_completed(
            step,
            reply.kind.as_str(),
            serde_json::to_value(&reply.payload)?,
        ))
    }

    /// Appends the plan's events, then runs its effects.
    async fn commit(
        &self,
        saga: &SagaInstance,
        kind: D::Kind,
        plan: Plan<D>,
        entity: EntityOf<D>,
    ) -> Result<()> {
        let saga_id = saga.id();
        self.append(saga_id, saga.saga_type(), saga.version(), &plan.events)
            .await?;

        for event in &plan.events {
            self.record_outcome(saga, event);
        }

        let mut first_error = None;
        for effect in plan.effects {
            let result = match effect {
                Effect::Publish { command, attempt } => {
                    self.publish_command(saga_id, command, entity.clone(), attempt)
                        .await
                }
                Effect::StartChild {
                    child_id,
                    kind: child_kind,
                } => {
                    self.start_kind(child_id, child_kind, entity.clone(), Some(saga_id))
                        .await
                }
                Effect::Relay { parent_id, outcome } => {
                    self.relay(parent_id, kind, outcome, saga, entity.clone())
                        .await
                }
                Effect::Alert { step, reason } => {
                    self.alerts.raise(Alert {
                        saga_id,
                        saga_type: saga.saga_type().to_string(),
                        step,
                        reason,
                        raised_at: Utc::now(),
                    });
                    Ok(())
                }
            };
            if let Err(e) = result {
                tracing::warn!(%saga_id, error = %e, "side effect failed after commit");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn record_outcome(&self, saga: &SagaInstance, event: &SagaEvent) {
        let saga_type = saga.saga_type().to_string();
        let elapsed = (event.occurred_at() - saga.created_at())
            .to_std()
            .unwrap_or_default()
            .as_secs_f64();
        match event {
            SagaEvent::SagaCompleted(_) => {
                metrics::counter!("saga_completed", "saga_type" => saga_type.clone()).increment(1);
                metrics::histogram!("saga_duration_seconds", "saga_type" => saga_type)
                    .record(elapsed);
                tracing::info!(saga_id = %saga.id(), duration = elapsed, "saga completed");
            }
            SagaEvent::SagaFailed(data) => {
                metrics::counter!("saga_failed", "saga_type" => saga_type.clone()).increment(1);
                metrics::histogram!("saga_duration_seconds", "saga_type" => saga_type)
                    .record(elapsed);
                tracing::warn!(
                    saga_id = %saga.id(),
                    reason = saga.failure_reason().unwrap_or(data.reason.as_str()),
                    "saga failed and was compensated"
                );
            }
            SagaEvent::SagaCompensationFailed(data) => {
                metrics::counter!("saga_compensation_failed", "saga_type" => saga_type)
                    .increment(1);
                tracing::error!(saga_id = %saga.id(), step = %data.step, reason = %data.reason, "compensation failed");
            }
            SagaEvent::CompensationPlanned(data) => {
                tracing::info!(saga_id = %saga.id(), plan = ?data.plan, "compensation planned");
            }
            SagaEvent::EscalationDeferred(data) => {
                tracing::warn!(saga_id = %saga.id(), step = %data.step, reason = %data.reason, "child cleanup failed, rolling back before escalating");
            }
            _ => {}
        }
    }

    async fn publish_command(
        &self,
        saga_id: SagaId,
        command: CommandOf<D>,
        entity: EntityOf<D>,
        attempt: u32,
    ) -> Result<()> {
        let message = Command::<D::Schema>::new(saga_id, command, entity, attempt);
        let envelope = Envelope::encode(&message)?;
        publish_with_retry(
            self.bus.as_ref(),
            <D::Schema as SagaSchema>::COMMAND_TOPIC,
            envelope,
            &self.config.publish_retry,
        )
        .await?;
        metrics::counter!("saga_commands_published_total", "command" => command.as_str())
            .increment(1);
        tracing::debug!(%saga_id, %command, attempt, "command published");
        Ok(())
    }

    /// Reports a child saga's outcome to its parent as a reply to the step
    /// the parent delegated.
    async fn relay(
        &self,
        parent_id: SagaId,
        kind: D::Kind,
        outcome: Outcome,
        child: &SagaInstance,
        entity: EntityOf<D>,
    ) -> Result<()> {
        let Some(reply_kind) = D::relay(kind, outcome) else {
            return Ok(());
        };
        let mut reply =
            Reply::<D::Schema>::synthetic(parent_id, D::initial_command(kind), reply_kind, entity);
        if outcome != Outcome::Completed
            && let Some(reason) = child.failure_reason()
        {
            reply = reply.with_reason(reason);
        }
        let envelope = Envelope::encode(&reply)?;
        publish_with_retry(
            self.bus.as_ref(),
            <D::Schema as SagaSchema>::REPLY_TOPIC,
            envelope,
            &self.config.publish_retry,
        )
        .await?;
        tracing::info!(%parent_id, child_id = %child.id(), reply = %reply_kind, "child outcome relayed");
        Ok(())
    }

    async fn append(
        &self,
        saga_id: SagaId,
        saga_type: &str,
        base: Version,
        events: &[SagaEvent],
    ) -> Result<Version> {
        let mut version = base;
        let mut batch = Vec::with_capacity(events.len());
        for event in events {
            version = version.next();
            let stored = StoredEvent::builder()
                .saga_id(saga_id)
                .saga_type(saga_type)
                .event_type(event.event_type())
                .version(version)
                .payload(event)?
                .build()
                .ok_or_else(|| SagaError::corrupt(saga_id, "incomplete stored event"))?;
            batch.push(stored);
        }
        Ok(self
            .store
            .append(batch, AppendOptions::expect_version(base))
            .await?)
    }

    async fn load(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        let log = self.store.load(saga_id).await?;
        SagaInstance::from_log(saga_id, &log)
    }

    /// Loads a saga by id.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaInstance>> {
        self.load(saga_id).await
    }

    /// Every non-terminal saga of this definition's kinds.
    pub async fn open_sagas(&self) -> Result<Vec<SagaInstance>> {
        let mut sagas = Vec::new();
        for kind in D::KINDS {
            let ids = self
                .store
                .open_saga_ids(D::kind_name(*kind), TERMINAL_EVENT_TYPES)
                .await?;
            for id in ids {
                if let Some(saga) = self.load(id).await? {
                    sagas.push(saga);
                }
            }
        }
        Ok(sagas)
    }

    /// Acts on every saga whose awaited step has been silent for longer than
    /// `step_timeout` at `now`: republish, then compensate, then escalate.
    ///
    /// Steps delegated to a running child saga are left to the child's own
    /// watchdog. A parent still waiting on a child that finished more than
    /// `step_timeout` ago gets the child's outcome again.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_stalled(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let timeout = TimeDelta::from_std(self.config.step_timeout).unwrap_or(TimeDelta::MAX);
        let mut report = SweepReport::default();

        for saga in self.open_sagas().await? {
            if let Some(child_id) = saga.delegated_to() {
                let settled_before = now
                    .checked_sub_signed(timeout)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC);
                match self
                    .resend_child_outcome(&saga, child_id, settled_before)
                    .await
                {
                    Ok(true) => report.relayed += 1,
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(saga_id = %saga.id(), %child_id, error = %e, "could not resend child outcome");
                    }
                }
                continue;
            }
            let Some(awaiting) = saga.awaiting().cloned() else {
                continue;
            };
            if now - awaiting.since < timeout {
                continue;
            }

            match self.resolve_stall(&saga, &awaiting).await {
                Ok(Stall::Retried) => report.retried += 1,
                Ok(Stall::Compensated) => report.compensated += 1,
                Ok(Stall::Escalated) => report.escalated += 1,
                Err(e) if e.is_conflict() => {
                    tracing::debug!(saga_id = %saga.id(), "saga moved during sweep, skipping");
                }
                Err(e) => {
                    tracing::warn!(saga_id = %saga.id(), error = %e, "could not resolve stalled saga");
                }
            }
        }

        if !report.is_empty() {
            tracing::info!(?report, "watchdog sweep");
        }
        Ok(report)
    }

    async fn resolve_stall(&self, saga: &SagaInstance, awaiting: &AwaitingStep) -> Result<Stall> {
        let kind = kind_of::<D>(saga)?;
        let step = parse_step::<D>(saga.id(), &awaiting.step)?;
        let entity: EntityOf<D> = serde_json::from_value(saga.entity().clone())?;
        let saga_type = saga.saga_type().to_string();

        if awaiting.attempt < self.config.max_attempts {
            let attempt = awaiting.attempt + 1;
            let plan = Plan::new()
                .event(SagaEvent::command_issued(
                    step.as_str(),
                    attempt,
                    awaiting.compensating,
                ))
                .effect(Effect::Publish {
                    command: step,
                    attempt,
                });
            tracing::info!(saga_id = %saga.id(), %step, attempt, "step timed out, retrying");
            metrics::counter!("saga_step_retries_total", "saga_type" => saga_type).increment(1);
            self.commit(saga, kind, plan, entity).await?;
            return Ok(Stall::Retried);
        }

        let reason = format!("no reply after {} attempts", awaiting.attempt);
        metrics::counter!("saga_step_timeouts_total", "saga_type" => saga_type).increment(1);

        if awaiting.compensating {
            let plan = Plan::new().escalate(saga, step.as_str(), reason);
            self.commit(saga, kind, plan, entity).await?;
            return Ok(Stall::Escalated);
        }

        let committed = parse_steps::<D>(saga.completed_steps());
        let steps = compensation_plan::<D>(D::cancel(step), &committed);
        let plan = Plan::new()
            .event(SagaEvent::step_failed(step.as_str(), reason))
            .compensate(saga, steps);
        self.commit(saga, kind, plan, entity).await?;
        Ok(Stall::Compensated)
    }

    /// Sends the outcome of a child that finished at or before
    /// `settled_before` to a parent still waiting on it. Returns false when
    /// the child is missing or still running.
    ///
    /// The parent treats a second copy of the same outcome as a duplicate.
    async fn resend_child_outcome(
        &self,
        parent: &SagaInstance,
        child_id: SagaId,
        settled_before: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(child) = self.load(child_id).await? else {
            return Ok(false);
        };
        let outcome = match child.state() {
            SagaState::Completed => Outcome::Completed,
            SagaState::Failed => Outcome::Failed,
            SagaState::CompensationFailed => Outcome::CompensationFailed,
            SagaState::NotStarted | SagaState::Running | SagaState::Compensating => {
                return Ok(false);
            }
        };
        if child.updated_at() > settled_before {
            return Ok(false);
        }

        let kind = kind_of::<D>(&child)?;
        let entity: EntityOf<D> = serde_json::from_value(child.entity().clone())?;
        tracing::info!(parent_id = %parent.id(), %child_id, ?outcome, "parent still waiting on finished child");
        metrics::counter!("saga_relays_resent_total", "saga_type" => child.saga_type().to_string())
            .increment(1);
        self.relay(parent.id(), kind, outcome, &child, entity).await?;
        Ok(true)
    }

    /// Resumes sagas after a restart: republishes every awaited command,
    /// starts child sagas whose creation was lost and resends the outcome of
    /// children that finished while their parent was not listening. Returns
    /// how many sagas were touched.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<usize> {
        let mut resumed = 0;
        for saga in self.open_sagas().await? {
            let Some(awaiting) = saga.awaiting() else {
                continue;
            };
            let entity: EntityOf<D> = serde_json::from_value(saga.entity().clone())?;

            match (saga.delegated_to(), saga.delegated_type()) {
                (Some(child_id), Some(child_type)) => {
                    if self.store.exists(child_id).await? {
                        if self
                            .resend_child_outcome(&saga, child_id, Utc::now())
                            .await?
                        {
                            resumed += 1;
                        }
                        continue;
                    }
                    let Some(child_kind) = D::parse_kind(child_type) else {
                        return Err(SagaError::corrupt(
                            saga.id(),
                            format!("unknown child saga type {child_type}"),
                        ));
                    };
                    match self
                        .start_kind(child_id, child_kind, entity, Some(saga.id()))
                        .await
                    {
                        Err(e) if e.is_conflict() => continue,
                        other => other?,
                    }
                }
                _ => {
                    let step = parse_step::<D>(saga.id(), &awaiting.step)?;
                    self.publish_command(saga.id(), step, entity, awaiting.attempt)
                        .await?;
                }
            }
            resumed += 1;
        }
        tracing::info!(resumed, "saga recovery finished");
        Ok(resumed)
    }

    /// Runs [`Self::sweep_stalled`] every `interval` until the task is aborted.
    ///
    /// A zero `interval` is raised to one millisecond.
    pub fn spawn_watchdog(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let interval = interval.max(MIN_SWEEP_INTERVAL);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = self.sweep_stalled(Utc::now()).await {
                    tracing::warn!(error = %e, "watchdog sweep failed");
                }
            }
        })
    }

    /// Subscribes to the reply topic under `group`.
    pub async fn subscribe(self: &Arc<Self>, group: &str) -> bus::Result<()> {
        self.bus
            .subscribe_typed::<Reply<D::Schema>, _>(group, self.clone())
            .await
    }
}

impl<D: SagaDefinition> Plan<D> {
    /// Records the plan and issues its first command, or fails the saga
    /// when nothing needs undoing.
    fn compensate(self, saga: &SagaInstance, steps: Vec<CommandOf<D>>) -> Self {
        let Some(first) = steps.first().copied() else {
            return self.fail(saga);
        };
        self.event(SagaEvent::compensation_planned(
            steps.iter().map(|c| c.as_str().to_string()).collect(),
        ))
        .event(SagaEvent::command_issued(first.as_str(), 1, true))
        .effect(Effect::Publish {
            command: first,
            attempt: 1,
        })
    }

    /// Ends the saga once compensation is done. A deferred escalation turns
    /// the ending into `SagaCompensationFailed`.
    fn fail(self, saga: &SagaInstance) -> Self {
        if let Some(pending) = saga.deferred_escalation() {
            return self.escalate(saga, &pending.step, pending.reason.clone());
        }
        let reason = saga
            .failure_reason()
            .unwrap_or("compensated")
            .to_string();
        self.event(SagaEvent::saga_failed(reason))
            .relay_to(saga.parent_id(), Outcome::Failed)
    }

    /// Stops the saga for an operator.
    fn escalate(self, saga: &SagaInstance, step: &str, reason: String) -> Self {
        self.event(SagaEvent::compensation_failed(step, reason.clone()))
            .effect(Effect::Alert {
                step: step.to_string(),
                reason,
            })
            .relay_to(saga.parent_id(), Outcome::CompensationFailed)
    }
}

enum Stall {
    Retried,
    Compensated,
    Escalated,
}

fn kind_of<D: SagaDefinition>(saga: &SagaInstance) -> Result<D::Kind> {
    D::parse_kind(saga.saga_type()).ok_or_else(|| {
        SagaError::corrupt(
            saga.id(),
            format!("saga type {} is not driven here", saga.saga_type()),
        )
    })
}

fn parse_step<D: SagaDefinition>(saga_id: SagaId, step: &str) -> Result<CommandOf<D>> {
    let command = <CommandOf<D> as MessageType>::parse(step);
    if command.is_unknown() {
        return Err(SagaError::corrupt(saga_id, format!("unknown step {step}")));
    }
    Ok(command)
}

#[async_trait]
impl<D, S, B> Consumer<Reply<D::Schema>> for Orchestrator<D, S, B>
where
    D: SagaDefinition,
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    async fn consume(&self, reply: Reply<D::Schema>) -> std::result::Result<(), HandlerError> {
        match self.handle(reply).await {
            Ok(_) => Ok(()),
            Err(e @ SagaError::CorruptLog { .. }) => Err(HandlerError::Malformed(e.to_string())),
            Err(e) => Err(HandlerError::retry(e)),
        }
    }
}
