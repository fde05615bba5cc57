//! HTTP front door for the saga coordinator.
//!
//! `POST /users` and `POST /accommodations` start sagas and return at once
//! with `202 Accepted`; the saga runs over the message bus and its record is
//! readable at `GET /sagas/{id}`. Structured logging comes from `tracing`
//! and Prometheus metrics are served at `/metrics`.

pub mod config;
pub mod context;
pub mod error;
pub mod identity;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use bus::MessageBus;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::SagaStore;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub use config::{Config, LogFormat};
pub use context::AppContext;
pub use error::ApiError;
pub use identity::{Identity, IdentityError, IdentityResolver, StaticTokenResolver};

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, B>(ctx: Arc<AppContext<S, B>>, metrics_handle: PrometheusHandle) -> Router
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/users", post(routes::users::create::<S, B>))
        .route(
            "/accommodations",
            post(routes::accommodations::create::<S, B>),
        )
        .route("/sagas/{id}", get(routes::sagas::get::<S, B>))
        .with_state(ctx)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the context for `config`, subscribes every handler and resumes
/// sagas left open by a previous run.
pub async fn start_context<S, B>(
    config: &Config,
    store: Arc<S>,
    bus: Arc<B>,
    identity: Arc<dyn IdentityResolver>,
) -> Result<Arc<AppContext<S, B>>, ApiError>
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    let ctx = AppContext::new(store, bus, config.orchestrator_config(), identity);
    ctx.subscribe(config.retry_policy())
        .await
        .map_err(|e| ApiError::Internal(format!("subscribe failed: {e}")))?;

    let resumed = ctx.recover().await?;
    if resumed > 0 {
        tracing::info!(resumed, "resumed open sagas");
    }
    Ok(Arc::new(ctx))
}
