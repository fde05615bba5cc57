//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::{AppContext, Config, StaticTokenResolver};
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use bus::InMemoryBus;
use domain::Role;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::InMemorySagaStore;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

type Ctx = Arc<AppContext<InMemorySagaStore, InMemoryBus>>;

struct TestApp {
    app: axum::Router,
    ctx: Ctx,
}

async fn setup() -> TestApp {
    let config = Config {
        bus_retry_base: Duration::from_millis(1),
        ..Config::default()
    };
    let bus = Arc::new(InMemoryBus::connect(&config.bus_config()).await.unwrap());
    let identity = Arc::new(
        StaticTokenResolver::new()
            .with_token("host-token", "host-1", Role::Host)
            .with_token("guest-token", "guest-1", Role::Guest),
    );
    let ctx = api::start_context(&config, Arc::new(InMemorySagaStore::new()), bus, identity)
        .await
        .unwrap();

    TestApp {
        app: api::create_app(ctx.clone(), get_metrics_handle()),
        ctx,
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&body).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get(&self, uri: &str) -> (StatusCode, Value) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
    }

    async fn post(&self, uri: &str, token: Option<&str>, body: Value) -> (StatusCode, Value) {
        let mut builder = Request::builder()
            .method("POST")
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(builder.body(Body::from(body.to_string())).unwrap())
            .await
    }

    async fn settled_saga(&self, saga_id: &str) -> Value {
        self.ctx.bus.wait_idle().await;
        let (status, saga) = self.get(&format!("/sagas/{saga_id}")).await;
        assert_eq!(status, StatusCode::OK);
        saga
    }
}

fn ana() -> Value {
    json!({
        "username": "ana",
        "email": "ana@example.com",
        "first_name": "Ana",
        "last_name": "Silva",
        "city": "Porto",
    })
}

fn loft() -> Value {
    json!({
        "name": "Loft",
        "location": "Lisbon",
        "min_guests": 1,
        "max_guests": 4,
        "amenities": ["wifi"],
    })
}

#[tokio::test]
async fn test_health_check() {
    let app = setup().await;

    let (status, json) = app.get("/health").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn test_create_user_runs_saga_to_completion() {
    let app = setup().await;

    let (status, json) = app.post("/users", None, ana()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let saga_id = json["saga_id"].as_str().unwrap().to_string();

    let saga = app.settled_saga(&saga_id).await;
    assert_eq!(saga["saga_type"], "CreateUser");
    assert_eq!(saga["state"], "Completed");
    assert_eq!(saga["entity_id"], json["entity_id"]);
    assert_eq!(
        saga["completed_steps"],
        json!(["AddUser", "AddProfile", "SendMail"])
    );

    assert!(app.ctx.user_services.identity.find_by_username("ana").is_some());
    assert_eq!(app.ctx.user_services.mailer.sent_count(), 1);
}

#[tokio::test]
async fn test_create_user_failure_is_visible_in_saga_record() {
    let app = setup().await;
    app.ctx.user_services.mailer.set_fail_on_send(true);

    let (status, json) = app.post("/users", None, ana()).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let saga = app.settled_saga(json["saga_id"].as_str().unwrap()).await;
    assert_eq!(saga["state"], "Failed");
    assert!(saga["failure_reason"].is_string());
    assert_eq!(app.ctx.user_services.identity.user_count(), 0);
}

#[tokio::test]
async fn test_create_user_rejects_invalid_email() {
    let app = setup().await;

    let (status, json) = app
        .post(
            "/users",
            None,
            json!({ "username": "ana", "email": "not-an-email" }),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("email"));
    assert_eq!(app.ctx.store.event_count().await, 0);
}

#[tokio::test]
async fn test_create_accommodation_requires_token() {
    let app = setup().await;

    let (status, _) = app.post("/accommodations", None, loft()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app.post("/accommodations", Some("stolen"), loft()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_create_accommodation_requires_host_role() {
    let app = setup().await;

    let (status, json) = app
        .post("/accommodations", Some("guest-token"), loft())
        .await;

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(json["error"].as_str().unwrap().contains("guest-1"));
    assert_eq!(app.ctx.store.event_count().await, 0);
}

#[tokio::test]
async fn test_create_accommodation_as_host() {
    let app = setup().await;

    let (status, json) = app
        .post("/accommodations", Some("host-token"), loft())
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let saga = app.settled_saga(json["saga_id"].as_str().unwrap()).await;
    assert_eq!(saga["saga_type"], "CreateAccommodation");
    assert_eq!(saga["state"], "Completed");
    assert_eq!(saga["entity"]["host_id"], "host-1");

    let services = &app.ctx.accommodation_services;
    assert_eq!(services.listings.listing_count(), 1);
    assert_eq!(services.availability.window_count(), 1);
    assert_eq!(services.recommendations.node_count(), 1);
}

#[tokio::test]
async fn test_get_saga_not_found() {
    let app = setup().await;

    let (status, json) = app
        .get("/sagas/00000000-0000-0000-0000-000000000000")
        .await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].is_string());
}

#[tokio::test]
async fn test_get_saga_invalid_id() {
    let app = setup().await;

    let (status, _) = app.get("/sagas/not-a-uuid").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let app = setup().await;
    let (status, json) = app.post("/users", None, ana()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    app.settled_saga(json["saga_id"].as_str().unwrap()).await;

    let response = app
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("saga_started_total"));
}
