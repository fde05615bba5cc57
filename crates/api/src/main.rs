//! API server entry point.

use std::sync::Arc;

use api::{Config, IdentityResolver, LogFormat, StaticTokenResolver};
use bus::{InMemoryBus, MessageBus, NatsBus};
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{InMemorySagaStore, PostgresSagaStore, SagaStore};
use tokio::signal;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT, shutting down"),
        () = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    match config.log_format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json())
            .init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

async fn run<S: SagaStore + 'static>(
    config: Config,
    store: Arc<S>,
    metrics_handle: PrometheusHandle,
) {
    let bus_config = config.bus_config();
    if bus_config.is_nats() {
        let bus = NatsBus::connect(&bus_config)
            .await
            .expect("failed to connect to NATS");
        serve(config, store, Arc::new(bus.clone()), metrics_handle).await;
        bus.shutdown();
    } else {
        tracing::info!(url = %bus_config.url, "using in-process message bus");
        let bus = InMemoryBus::connect(&bus_config)
            .await
            .expect("failed to connect to message bus");
        serve(config, store, Arc::new(bus), metrics_handle).await;
    }
}

async fn serve<S, B>(config: Config, store: Arc<S>, bus: Arc<B>, metrics_handle: PrometheusHandle)
where
    S: SagaStore + 'static,
    B: MessageBus + 'static,
{
    let identity: Arc<dyn IdentityResolver> = Arc::new(
        StaticTokenResolver::parse(config.api_tokens.as_deref().unwrap_or_default())
            .expect("invalid API_TOKENS"),
    );

    let ctx = api::start_context(&config, store, bus, identity)
        .await
        .expect("failed to start saga handlers");
    let watchdogs = ctx.spawn_watchdogs(config.sweep_interval);

    let app = api::create_app(ctx, metrics_handle);
    let addr = config.addr();
    tracing::info!(%addr, "starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    for watchdog in watchdogs {
        watchdog.abort();
    }
    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    init_tracing(&config);

    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    match config.database_url.clone() {
        Some(url) => {
            let store = PostgresSagaStore::connect(&url)
                .await
                .expect("failed to connect to Postgres");
            store
                .run_migrations()
                .await
                .expect("failed to run saga store migrations");
            tracing::info!("using Postgres saga store");
            run(config, Arc::new(store), metrics_handle).await;
        }
        None => {
            tracing::info!("DATABASE_URL not set, using in-memory saga store");
            run(config, Arc::new(InMemorySagaStore::new()), metrics_handle).await;
        }
    }
}
