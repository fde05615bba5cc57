//! End-to-end saga runs over the in-memory bus and saga store.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bus::{BusConfig, Envelope, InMemoryBus, MessageBus, RetryPolicy};
use chrono::{NaiveDate, TimeDelta, Utc};
use domain::{
    AccommodationReplyType, AccommodationWithAvailability, CreateAccommodation,
    CreateAccommodationCommand, CreateUser, CreateUserCommand, CreateUserReply, EntityId, Price,
    Role, SagaId, SagaSchema, User, UserCommandType, UserReplyType,
};
use saga::{
    AccommodationOrchestrator, AccommodationServices, EffectError, HandleOutcome, Orchestrator,
    OrchestratorConfig, Participant, ParticipantHandler, RecordingAlertSink, Route, SagaError,
    SagaEvent, SagaState, UserOrchestrator, UserServices,
};
use saga_store::{InMemorySagaStore, SagaStore};

fn fast_retry() -> RetryPolicy {
    RetryPolicy::new(3, Duration::from_millis(1))
}

fn config() -> OrchestratorConfig {
    OrchestratorConfig::default()
        .with_max_attempts(2)
        .with_publish_retry(fast_retry())
}

async fn connect_bus() -> Arc<InMemoryBus> {
    let config = BusConfig::in_memory()
        .with_max_deliveries(5)
        .with_redelivery_base(Duration::from_millis(1))
        .with_recording(true);
    Arc::new(InMemoryBus::connect(&config).await.unwrap())
}

fn ana() -> User {
    User::new("ana", "ana@example.com", Role::Host)
        .with_name("Ana", "Ruiz")
        .with_city("Porto")
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Wraps a participant so one command type never gets an answer.
struct Mute<P> {
    inner: P,
    muted: UserCommandType,
}

#[async_trait]
impl<P: Participant<CreateUser>> Participant<CreateUser> for Mute<P> {
    fn name(&self) -> &'static str {
        self.inner.name()
    }

    fn route(&self, command: UserCommandType) -> Option<Route<UserReplyType>> {
        if command == self.muted {
            None
        } else {
            self.inner.route(command)
        }
    }

    async fn apply(&self, command: UserCommandType, user: &User) -> Result<Option<User>, EffectError> {
        self.inner.apply(command, user).await
    }
}

struct UserHarness {
    bus: Arc<InMemoryBus>,
    store: Arc<InMemorySagaStore>,
    services: UserServices,
    orchestrator: Arc<UserOrchestrator<InMemorySagaStore, InMemoryBus>>,
    alerts: Arc<RecordingAlertSink>,
}

impl UserHarness {
    /// Orchestrator subscribed to replies; no participants yet.
    async fn bare() -> Self {
        let bus = connect_bus().await;
        let store = Arc::new(InMemorySagaStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), bus.clone())
                .with_config(config())
                .with_alert_sink(alerts.clone()),
        );
        Self {
            bus,
            store,
            services: UserServices::new(),
            orchestrator,
            alerts,
        }
    }

    async fn new() -> Self {
        let h = Self::bare().await;
        h.orchestrator.subscribe("user-orchestrator").await.unwrap();
        h.services.subscribe(&h.bus, fast_retry()).await.unwrap();
        h
    }

    /// Like `new`, but `muted` commands reach no participant.
    async fn with_muted(muted: UserCommandType) -> Self {
        let h = Self::bare().await;
        h.orchestrator.subscribe("user-orchestrator").await.unwrap();
        let participants: Vec<Arc<dyn Participant<CreateUser>>> = vec![
            Arc::new(Mute {
                inner: h.services.identity.clone(),
                muted,
            }),
            Arc::new(Mute {
                inner: h.services.profiles.clone(),
                muted,
            }),
            Arc::new(Mute {
                inner: h.services.mailer.clone(),
                muted,
            }),
        ];
        for participant in participants {
            ParticipantHandler::new(participant, h.bus.clone(), fast_retry())
                .subscribe()
                .await
                .unwrap();
        }
        h
    }

    async fn run(&self, user: User) -> SagaId {
        let saga_id = self.orchestrator.start(user).await.unwrap();
        self.bus.wait_idle().await;
        saga_id
    }

    fn commands(&self) -> Vec<UserCommandType> {
        self.bus
            .published_on(CreateUser::COMMAND_TOPIC)
            .iter()
            .map(|e| e.decode::<CreateUserCommand>().unwrap().kind)
            .collect()
    }

    fn replies(&self) -> Vec<CreateUserReply> {
        self.bus
            .published_on(CreateUser::REPLY_TOPIC)
            .iter()
            .map(|e| e.decode::<CreateUserReply>().unwrap())
            .collect()
    }
}

// ---------------------------------------------------------------------------
// CreateUser
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_user_happy_path() {
    let h = UserHarness::new().await;
    let user = ana();

    let saga_id = h.run(user.clone()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Completed);
    assert_eq!(saga.completed_steps(), &["AddUser", "AddProfile", "SendMail"]);
    assert!(saga.compensated_steps().is_empty());
    assert_eq!(saga.entity_id(), &user.id);

    assert!(h.services.identity.has_user(&user.id));
    assert_eq!(
        h.services.profiles.profile(&user.id).unwrap().display_name,
        "Ana Ruiz"
    );
    assert_eq!(h.services.mailer.sent_count(), 1);
    assert!(h.bus.dead_letters().is_empty());
    assert!(h.orchestrator.open_sagas().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_user_is_rejected_before_any_saga_exists() {
    let h = UserHarness::new().await;
    let user = User::new("ana", "not-an-email", Role::Guest);

    let err = h.orchestrator.start(user).await.unwrap_err();
    assert!(matches!(err, SagaError::Validation(_)));
    assert_eq!(h.store.event_count().await, 0);
    assert!(h.bus.published().is_empty());
}

#[tokio::test]
async fn test_profile_failure_rolls_back_user() {
    let h = UserHarness::new().await;
    h.services.profiles.set_fail_on_add(true);
    let user = ana();

    let saga_id = h.run(user.clone()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Failed);
    assert_eq!(saga.completed_steps(), &["AddUser"]);
    assert_eq!(saga.compensated_steps(), &["RollbackUser"]);
    assert!(saga.failure_reason().unwrap().starts_with("AddProfile"));

    assert_eq!(h.services.identity.user_count(), 0);
    assert_eq!(h.services.profiles.profile_count(), 0);
    assert_eq!(h.services.mailer.sent_count(), 0);
}

#[tokio::test]
async fn test_mail_failure_compensates_in_reverse_order() {
    let h = UserHarness::new().await;
    h.services.mailer.set_fail_on_send(true);

    let saga_id = h.run(ana()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Failed);
    assert_eq!(saga.compensated_steps(), &["RollbackProfile", "RollbackUser"]);
    assert_eq!(
        h.commands(),
        vec![
            UserCommandType::AddUser,
            UserCommandType::AddProfile,
            UserCommandType::SendMail,
            UserCommandType::RollbackProfile,
            UserCommandType::RollbackUser,
        ]
    );
    assert_eq!(h.services.identity.user_count(), 0);
    assert_eq!(h.services.profiles.profile_count(), 0);
}

#[tokio::test]
async fn test_identity_failure_cancels_profile() {
    let h = UserHarness::new().await;
    h.services.identity.set_fail_on_add(true);
    let user = ana();

    let saga_id = h.run(user.clone()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Failed);
    assert!(saga.completed_steps().is_empty());
    assert_eq!(saga.compensated_steps(), &["CancelProfile"]);
    assert!(h.services.profiles.is_cancelled(&user.id));
    assert_eq!(h.services.identity.user_count(), 0);
}

#[tokio::test]
async fn test_redelivered_reply_is_a_duplicate() {
    let h = UserHarness::new().await;
    let saga_id = h.run(ana()).await;

    let first_reply = h
        .replies()
        .into_iter()
        .find(|r| r.kind == UserReplyType::UserAdded)
        .unwrap();
    let events_before = h.store.event_count().await;

    let outcome = h.orchestrator.handle(first_reply).await.unwrap();
    assert_eq!(outcome, HandleOutcome::Duplicate);
    assert_eq!(h.store.event_count().await, events_before);
    assert_eq!(
        h.orchestrator.get_saga(saga_id).await.unwrap().unwrap().state(),
        SagaState::Completed
    );
}

#[tokio::test]
async fn test_concurrent_duplicate_replies_apply_once() {
    // No participants: commands are published and dropped.
    let h = UserHarness::bare().await;
    let saga_id = h.orchestrator.start(ana()).await.unwrap();

    let command = h.bus.published_on(CreateUser::COMMAND_TOPIC)[0]
        .decode::<CreateUserCommand>()
        .unwrap();
    let reply = command.reply(UserReplyType::UserAdded, command.payload.clone());

    let (a, b) = tokio::join!(
        h.orchestrator.handle(reply.clone()),
        h.orchestrator.handle(reply.clone())
    );
    let mut outcomes = vec![a.unwrap(), b.unwrap()];
    outcomes.sort_by_key(|o| *o != HandleOutcome::Applied);
    assert_eq!(outcomes, vec![HandleOutcome::Applied, HandleOutcome::Duplicate]);

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert!(saga.is_awaiting("AddProfile"));
    assert_eq!(
        h.commands()
            .iter()
            .filter(|c| **c == UserCommandType::AddProfile)
            .count(),
        1
    );
}

#[tokio::test]
async fn test_reply_type_from_another_step_is_ignored() {
    let h = UserHarness::bare().await;
    let saga_id = h.orchestrator.start(ana()).await.unwrap();

    let command = h.bus.published_on(CreateUser::COMMAND_TOPIC)[0]
        .decode::<CreateUserCommand>()
        .unwrap();
    assert_eq!(command.kind, UserCommandType::AddUser);
    // Answers AddUser, but with the mailer's reply type.
    let reply = command.reply(UserReplyType::MailSent, command.payload.clone());

    assert_eq!(
        h.orchestrator.handle(reply).await.unwrap(),
        HandleOutcome::Ignored
    );
    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Running);
    assert!(saga.completed_steps().is_empty());
    assert!(saga.is_awaiting("AddUser"));
}

#[tokio::test]
async fn test_command_lost_after_commit_is_resent_by_watchdog() {
    let h = UserHarness::bare().await;
    let saga_id = h.orchestrator.start(ana()).await.unwrap();
    let command = h.bus.published_on(CreateUser::COMMAND_TOPIC)[0]
        .decode::<CreateUserCommand>()
        .unwrap();
    let reply = command.reply(UserReplyType::UserAdded, command.payload.clone());

    // The step commits but AddProfile never reaches the bus.
    h.bus.set_available(false);
    let err = h.orchestrator.handle(reply.clone()).await.unwrap_err();
    assert!(matches!(err, SagaError::Bus(_)));
    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert!(saga.is_awaiting("AddProfile"));

    // A redelivered reply changes nothing and publishes nothing.
    h.bus.set_available(true);
    let published = h.commands().len();
    assert_eq!(
        h.orchestrator.handle(reply).await.unwrap(),
        HandleOutcome::Duplicate
    );
    assert_eq!(h.commands().len(), published);

    h.orchestrator.subscribe("user-orchestrator").await.unwrap();
    h.services.subscribe(&h.bus, fast_retry()).await.unwrap();
    let later = Utc::now() + TimeDelta::seconds(60);
    let report = h.orchestrator.sweep_stalled(later).await.unwrap();
    assert_eq!(report.retried, 1);
    h.bus.wait_idle().await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Completed);
}

#[tokio::test]
async fn test_reply_for_unknown_saga() {
    let h = UserHarness::bare().await;
    let command = CreateUserCommand::new(SagaId::new(), UserCommandType::AddUser, ana(), 1);
    let reply = command.reply(UserReplyType::UserAdded, ana());

    let outcome = h.orchestrator.handle(reply).await.unwrap();
    assert_eq!(outcome, HandleOutcome::UnknownSaga);
}

#[tokio::test]
async fn test_unknown_reply_type_is_ignored() {
    let h = UserHarness::bare().await;
    let saga_id = h.orchestrator.start(ana()).await.unwrap();

    let command = h.bus.published_on(CreateUser::COMMAND_TOPIC)[0]
        .decode::<CreateUserCommand>()
        .unwrap();
    let reply = command.reply(UserReplyType::Unknown, command.payload.clone());

    assert_eq!(
        h.orchestrator.handle(reply).await.unwrap(),
        HandleOutcome::Ignored
    );
    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Running);
    assert!(saga.is_awaiting("AddUser"));
}

#[tokio::test]
async fn test_unknown_command_type_is_acked_and_ignored() {
    let h = UserHarness::new().await;
    let command = CreateUserCommand::new(SagaId::new(), UserCommandType::AddUser, ana(), 1);
    let mut envelope = Envelope::encode(&command).unwrap();
    envelope.payload["type"] = serde_json::json!("MergeAccounts");

    h.bus
        .publish(CreateUser::COMMAND_TOPIC, envelope)
        .await
        .unwrap();
    h.bus.wait_idle().await;

    assert!(h.replies().is_empty());
    assert!(h.bus.dead_letters().is_empty());
    assert_eq!(h.services.identity.user_count(), 0);
}

#[tokio::test]
async fn test_participant_applies_redelivered_command_once() {
    let h = UserHarness::bare().await;
    h.services.subscribe(&h.bus, fast_retry()).await.unwrap();

    let command = CreateUserCommand::new(SagaId::new(), UserCommandType::SendMail, ana(), 1);
    let envelope = Envelope::encode(&command).unwrap();
    h.bus
        .publish(CreateUser::COMMAND_TOPIC, envelope.clone())
        .await
        .unwrap();
    h.bus
        .publish(CreateUser::COMMAND_TOPIC, envelope)
        .await
        .unwrap();
    h.bus.wait_idle().await;

    assert_eq!(h.services.mailer.sent_count(), 1);
    let replies = h.replies();
    assert_eq!(replies.len(), 2);
    assert!(replies.iter().all(|r| r.kind == UserReplyType::MailSent));
}

#[tokio::test]
async fn test_watchdog_retries_then_compensates_silent_step() {
    let h = UserHarness::with_muted(UserCommandType::SendMail).await;
    let user = ana();
    let saga_id = h.run(user.clone()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert!(saga.is_awaiting("SendMail"));

    let later = Utc::now() + TimeDelta::seconds(60);
    let report = h.orchestrator.sweep_stalled(later).await.unwrap();
    assert_eq!(report.retried, 1);
    h.bus.wait_idle().await;
    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.awaiting().map(|a| a.attempt), Some(2));

    let later = Utc::now() + TimeDelta::seconds(60);
    let report = h.orchestrator.sweep_stalled(later).await.unwrap();
    assert_eq!(report.compensated, 1);
    h.bus.wait_idle().await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Failed);
    assert_eq!(
        saga.compensated_steps(),
        &["CancelMail", "RollbackProfile", "RollbackUser"]
    );
    assert_eq!(h.services.identity.user_count(), 0);
    assert_eq!(h.services.profiles.profile_count(), 0);

    // The cancellation outlives the saga: a late SendMail is refused.
    let late = h
        .services
        .mailer
        .apply(UserCommandType::SendMail, &user)
        .await;
    assert!(matches!(late, Err(EffectError::Cancelled { .. })));
}

#[tokio::test]
async fn test_sweep_leaves_fresh_steps_alone() {
    let h = UserHarness::with_muted(UserCommandType::AddUser).await;
    h.run(ana()).await;

    let report = h.orchestrator.sweep_stalled(Utc::now()).await.unwrap();
    assert!(report.is_empty());
}

#[tokio::test]
async fn test_watchdog_survives_zero_interval() {
    let h = UserHarness::new().await;

    let watchdog = h.orchestrator.clone().spawn_watchdog(Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(20)).await;

    assert!(!watchdog.is_finished());
    watchdog.abort();
}

#[tokio::test]
async fn test_failed_compensation_raises_alert() {
    let h = UserHarness::new().await;
    h.services.mailer.set_fail_on_send(true);
    h.services.profiles.set_fail_on_compensate(true);

    let saga_id = h.run(ana()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::CompensationFailed);
    // RollbackUser is never issued once a compensation fails.
    assert_eq!(h.services.identity.user_count(), 1);

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].saga_id, saga_id);
    assert_eq!(alerts[0].step, "RollbackProfile");
}

#[tokio::test]
async fn test_silent_compensation_is_escalated() {
    let h = UserHarness::with_muted(UserCommandType::RollbackUser).await;
    h.services.profiles.set_fail_on_add(true);
    let saga_id = h.run(ana()).await;

    for _ in 0..2 {
        let later = Utc::now() + TimeDelta::seconds(60);
        h.orchestrator.sweep_stalled(later).await.unwrap();
        h.bus.wait_idle().await;
    }

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::CompensationFailed);
    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].step, "RollbackUser");
}

#[tokio::test]
async fn test_recover_republishes_awaited_commands() {
    let h = UserHarness::bare().await;
    let saga_id = h.orchestrator.start(ana()).await.unwrap();
    h.bus.wait_idle().await;

    // Services and the reply consumer come up after the saga started.
    h.orchestrator.subscribe("user-orchestrator").await.unwrap();
    h.services.subscribe(&h.bus, fast_retry()).await.unwrap();

    let resumed = h.orchestrator.recover().await.unwrap();
    assert_eq!(resumed, 1);
    h.bus.wait_idle().await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Completed);
}

// ---------------------------------------------------------------------------
// CreateAccommodation
// ---------------------------------------------------------------------------

struct AccommodationHarness {
    bus: Arc<InMemoryBus>,
    store: Arc<InMemorySagaStore>,
    services: AccommodationServices,
    orchestrator: Arc<AccommodationOrchestrator<InMemorySagaStore, InMemoryBus>>,
    alerts: Arc<RecordingAlertSink>,
}

impl AccommodationHarness {
    /// Orchestrator and services built but not subscribed.
    async fn bare() -> Self {
        let bus = connect_bus().await;
        let store = Arc::new(InMemorySagaStore::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let orchestrator = Arc::new(
            Orchestrator::new(store.clone(), bus.clone())
                .with_config(config())
                .with_alert_sink(alerts.clone()),
        );
        Self {
            bus,
            store,
            services: AccommodationServices::new(),
            orchestrator,
            alerts,
        }
    }

    async fn new() -> Self {
        let h = Self::bare().await;
        h.subscribe().await;
        h
    }

    async fn subscribe(&self) {
        self.orchestrator
            .subscribe("accommodation-orchestrator")
            .await
            .unwrap();
        self.services.subscribe(&self.bus, fast_retry()).await.unwrap();
    }

    /// Last command published for `saga_id`.
    fn last_command(&self, saga_id: SagaId) -> CreateAccommodationCommand {
        self.bus
            .published_on(CreateAccommodation::COMMAND_TOPIC)
            .iter()
            .map(|e| e.decode::<CreateAccommodationCommand>().unwrap())
            .rev()
            .find(|c| c.saga_id() == saga_id)
            .unwrap()
    }

    /// Drives a bare listing by hand until its availability child has
    /// completed while the bus was down, so the parent never heard back.
    async fn child_finished_unheard(&self) -> (SagaId, SagaId) {
        let parent_id = self.orchestrator.start(loft()).await.unwrap();
        let add = self.last_command(parent_id);
        let added = add.reply(AccommodationReplyType::AccommodationAdded, add.payload.clone());
        self.orchestrator.handle(added).await.unwrap();

        let child_id = self.child_of(parent_id).await;
        let availability = self.last_command(child_id);
        let reply = availability.reply(
            AccommodationReplyType::AvailabilityAdded,
            availability.payload.clone(),
        );
        self.bus.set_available(false);
        assert!(self.orchestrator.handle(reply).await.is_err());
        self.bus.set_available(true);

        let child = self.orchestrator.get_saga(child_id).await.unwrap().unwrap();
        assert_eq!(child.state(), SagaState::Completed);
        let parent = self.orchestrator.get_saga(parent_id).await.unwrap().unwrap();
        assert_eq!(parent.delegated_to(), Some(child_id));
        (parent_id, child_id)
    }

    async fn run(&self, listing: AccommodationWithAvailability) -> SagaId {
        let saga_id = self.orchestrator.start(listing).await.unwrap();
        self.bus.wait_idle().await;
        saga_id
    }

    async fn child_of(&self, parent: SagaId) -> SagaId {
        self.store
            .load(parent)
            .await
            .unwrap()
            .iter()
            .filter(|e| e.event_type == "ChildSagaStarted")
            .find_map(|e| match e.decode::<SagaEvent>().unwrap() {
                SagaEvent::ChildSagaStarted(data) => Some(data.child_id),
                _ => None,
            })
            .unwrap()
    }
}

fn loft() -> AccommodationWithAvailability {
    AccommodationWithAvailability::new(EntityId::new("host-1"), "Loft", "Lisbon", 1, 4)
        .with_amenities(["wifi", "kitchen"])
}

#[tokio::test]
async fn test_listing_with_window_skips_availability_child() {
    let h = AccommodationHarness::new().await;
    let listing =
        loft().with_availability(Price::per_stay(9_000), date(2026, 6, 1), date(2026, 6, 30));

    let saga_id = h.run(listing.clone()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Completed);
    assert_eq!(saga.completed_steps(), &["AddAccommodation", "AddRecommendation"]);
    assert!(h.services.listings.listing(&listing.id).is_some());
    assert!(h.services.recommendations.contains(&listing.id));
    assert_eq!(h.services.availability.window_count(), 0);
}

#[tokio::test]
async fn test_listing_without_window_runs_availability_child() {
    let h = AccommodationHarness::new().await;
    let listing = loft();

    let parent_id = h.run(listing.clone()).await;

    let parent = h.orchestrator.get_saga(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state(), SagaState::Completed);
    assert_eq!(
        parent.completed_steps(),
        &["AddAccommodation", "AddAvailability", "AddRecommendation"]
    );
    assert_eq!(parent.entity()["availability_id"], "AV-0001");

    let child_id = h.child_of(parent_id).await;
    let child = h.orchestrator.get_saga(child_id).await.unwrap().unwrap();
    assert_eq!(child.saga_type(), "CreateAvailability");
    assert_eq!(child.parent_id(), Some(parent_id));
    assert_eq!(child.state(), SagaState::Completed);

    let window = h.services.availability.window(&listing.id).unwrap();
    assert_eq!(window.availability_id, "AV-0001");
}

#[tokio::test]
async fn test_child_failure_is_relayed_and_parent_compensates() {
    let h = AccommodationHarness::new().await;
    h.services.availability.set_fail_on_add(true);
    let listing = loft();

    let parent_id = h.run(listing.clone()).await;

    let child = h
        .orchestrator
        .get_saga(h.child_of(parent_id).await)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(child.state(), SagaState::Failed);
    assert_eq!(child.compensated_steps(), &["CancelAvailability"]);

    let parent = h.orchestrator.get_saga(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state(), SagaState::Failed);
    assert_eq!(parent.completed_steps(), &["AddAccommodation"]);
    assert_eq!(parent.compensated_steps(), &["RollbackAccommodation"]);
    assert_eq!(h.services.listings.listing_count(), 0);
    assert_eq!(h.services.recommendations.node_count(), 0);
}

#[tokio::test]
async fn test_recommendation_failure_unwinds_every_step() {
    let h = AccommodationHarness::new().await;
    h.services.recommendations.set_fail_on_add(true);

    let saga_id = h.run(loft()).await;

    let saga = h.orchestrator.get_saga(saga_id).await.unwrap().unwrap();
    assert_eq!(saga.state(), SagaState::Failed);
    assert_eq!(
        saga.compensated_steps(),
        &["RemoveRecommendation", "CancelAvailability", "RollbackAccommodation"]
    );
    assert_eq!(h.services.listings.listing_count(), 0);
    assert_eq!(h.services.availability.window_count(), 0);

    let commands: Vec<_> = h
        .bus
        .published_on("create_accommodation.command")
        .iter()
        .map(|e| e.decode::<CreateAccommodationCommand>().unwrap().kind.to_string())
        .collect();
    assert_eq!(commands.last().map(String::as_str), Some("RollbackAccommodation"));
}

#[tokio::test]
async fn test_child_cleanup_failure_still_rolls_back_parent() {
    let h = AccommodationHarness::new().await;
    h.services.availability.set_fail_on_add(true);
    h.services.availability.set_fail_on_cancel(true);

    let parent_id = h.run(loft()).await;

    let child_id = h.child_of(parent_id).await;
    let child = h.orchestrator.get_saga(child_id).await.unwrap().unwrap();
    assert_eq!(child.state(), SagaState::CompensationFailed);

    let parent = h.orchestrator.get_saga(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state(), SagaState::CompensationFailed);
    assert_eq!(parent.completed_steps(), &["AddAccommodation"]);
    assert_eq!(parent.compensated_steps(), &["RollbackAccommodation"]);
    assert!(parent.failure_reason().unwrap().starts_with("AddAvailability"));
    assert_eq!(h.services.listings.listing_count(), 0);

    let alerts = h.alerts.alerts();
    assert_eq!(alerts.len(), 2);
    assert!(alerts.iter().any(|a| a.saga_id == child_id && a.step == "CancelAvailability"));
    assert!(alerts.iter().any(|a| a.saga_id == parent_id && a.step == "AddAvailability"));
}

#[tokio::test]
async fn test_watchdog_resends_outcome_of_finished_child() {
    let h = AccommodationHarness::bare().await;
    let (parent_id, _) = h.child_finished_unheard().await;
    h.subscribe().await;

    // A fresh outcome may still be in flight; leave it alone.
    let report = h.orchestrator.sweep_stalled(Utc::now()).await.unwrap();
    assert_eq!(report.relayed, 0);

    let later = Utc::now() + TimeDelta::seconds(60);
    let report = h.orchestrator.sweep_stalled(later).await.unwrap();
    assert_eq!(report.relayed, 1);
    h.bus.wait_idle().await;

    let parent = h.orchestrator.get_saga(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state(), SagaState::Completed);
    assert_eq!(
        parent.completed_steps(),
        &["AddAccommodation", "AddAvailability", "AddRecommendation"]
    );
}

#[tokio::test]
async fn test_recover_resends_outcome_of_finished_child() {
    let h = AccommodationHarness::bare().await;
    let (parent_id, _) = h.child_finished_unheard().await;
    h.subscribe().await;

    let resumed = h.orchestrator.recover().await.unwrap();
    assert_eq!(resumed, 1);
    h.bus.wait_idle().await;

    let parent = h.orchestrator.get_saga(parent_id).await.unwrap().unwrap();
    assert_eq!(parent.state(), SagaState::Completed);
    assert_eq!(h.services.recommendations.node_count(), 1);
}
