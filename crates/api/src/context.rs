//! Process-wide wiring: store, bus, orchestrators and participant services.

use std::sync::Arc;

use bus::{MessageBus, RetryPolicy};
use saga::{
    AccommodationOrchestrator, AccommodationServices, OrchestratorConfig, SagaError,
    UserOrchestrator, UserServices,
};
use saga_store::SagaStore;
use tokio::task::JoinHandle;

use crate::identity::IdentityResolver;

pub const USER_ORCHESTRATOR_GROUP: &str = "create-user-orchestrator";
pub const ACCOMMODATION_ORCHESTRATOR_GROUP: &str = "create-accommodation-orchestrator";

/// Everything a request handler needs. Built once at startup.
pub struct AppContext<S: SagaStore, B: MessageBus> {
    pub store: Arc<S>,
    pub bus: Arc<B>,
    pub users: Arc<UserOrchestrator<S, B>>,
    pub accommodations: Arc<AccommodationOrchestrator<S, B>>,
    pub user_services: UserServices,
    pub accommodation_services: AccommodationServices,
    pub identity: Arc<dyn IdentityResolver>,
}

impl<S, B> AppContext<S, B>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    pub fn new(
        store: Arc<S>,
        bus: Arc<B>,
        config: OrchestratorConfig,
        identity: Arc<dyn IdentityResolver>,
    ) -> Self {
        let users =
            UserOrchestrator::new(store.clone(), bus.clone()).with_config(config.clone());
        let accommodations =
            AccommodationOrchestrator::new(store.clone(), bus.clone()).with_config(config);
        Self {
            store,
            bus,
            users: Arc::new(users),
            accommodations: Arc::new(accommodations),
            user_services: UserServices::new(),
            accommodation_services: AccommodationServices::new(),
            identity,
        }
    }

    /// Subscribes both orchestrators and the in-process participant services.
    pub async fn subscribe(&self, retry: RetryPolicy) -> bus::Result<()> {
        self.users.subscribe(USER_ORCHESTRATOR_GROUP).await?;
        self.accommodations
            .subscribe(ACCOMMODATION_ORCHESTRATOR_GROUP)
            .await?;
        self.user_services.subscribe(&self.bus, retry).await?;
        self.accommodation_services
            .subscribe(&self.bus, retry)
            .await?;
        Ok(())
    }

    /// Resumes every open saga. Returns how many were resumed.
    pub async fn recover(&self) -> Result<usize, SagaError> {
        let users = self.users.recover().await?;
        let accommodations = self.accommodations.recover().await?;
        Ok(users + accommodations)
    }

    pub fn spawn_watchdogs(&self, interval: std::time::Duration) -> [JoinHandle<()>; 2] {
        [
            self.users.clone().spawn_watchdog(interval),
            self.accommodations.clone().spawn_watchdog(interval),
        ]
    }
}
