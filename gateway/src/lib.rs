//! The `gateway` binary crate: a thin axum HTTP/WebSocket skin over the
//! [`gateway_core`] request lifecycle engine.
//!
//! [`Application`] owns the database pool, the [`gateway_core::Engine`],
//! the axum router, and the background task handles (dispatch workers,
//! health monitor, cleanup loop). Its lifecycle is create → serve →
//! graceful shutdown.

pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod state;
pub mod telemetry;

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use gateway_core::storage::postgres::PostgresStorage;
use gateway_core::Engine;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::{info, Level};

use crate::config::{Config, CorsOrigin};
use crate::db::EmbeddedDatabaseHandle;
use crate::state::AppState;

fn build_cors_layer(config: &Config) -> anyhow::Result<CorsLayer> {
    let origins = config.cors_origins();
    let cors = if origins.len() == 1 && origins[0] == CorsOrigin::Wildcard {
        CorsLayer::permissive()
    } else {
        let values: Result<Vec<HeaderValue>, _> = origins
            .iter()
            .map(|o| match o {
                CorsOrigin::Wildcard => "*".parse::<HeaderValue>(),
                CorsOrigin::Url(u) => u.parse::<HeaderValue>(),
            })
            .collect();
        CorsLayer::new().allow_origin(values?).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
    };
    Ok(cors)
}

/// Builds the full router: REST surface, WebSocket feed, health check, and
/// the CORS/tracing middleware stack.
pub fn build_router(state: AppState, config: &Config) -> anyhow::Result<Router> {
    let api_routes = Router::new()
        .route("/ask", post(api::requests::ask))
        .route("/reply/{id}", get(api::requests::get_reply))
        .route("/request/{id}", delete(api::requests::cancel_request))
        .route("/requests", get(api::requests::list_requests))
        .route("/discussions", post(api::discussions::start_discussion))
        .route("/discussions/{id}", get(api::discussions::get_discussion))
        .route("/discussions/{id}", delete(api::discussions::cancel_discussion))
        .route("/discussions/{id}/messages", get(api::discussions::list_discussion_messages))
        .route("/discussions/{id}/continue", post(api::discussions::continue_discussion))
        .route("/status", get(api::status::status))
        .route("/queue", get(api::status::queue))
        .route("/providers", get(api::status::providers))
        .route("/health", get(api::status::health))
        .route("/ws", get(api::ws::ws_handler));

    let router = Router::new().nest("/api", api_routes).route("/healthz", get(|| async { "OK" })).with_state(state);

    let router = router.layer(build_cors_layer(config)?);
    let router = router.layer(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_request(DefaultOnRequest::new().level(Level::DEBUG))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    );

    Ok(router)
}

/// Owns the process's resources end to end: database pool, engine,
/// background loops, and the HTTP server.
pub struct Application {
    router: Router,
    config: Config,
    engine: Arc<Engine<PostgresStorage>>,
    shutdown_token: CancellationToken,
    handles: gateway_core::EngineHandles,
    _embedded_db: Option<EmbeddedDatabaseHandle>,
}

impl Application {
    pub async fn new(config: Config) -> anyhow::Result<Self> {
        let (pool, embedded_db) = db::connect(&config).await?;
        let storage = Arc::new(PostgresStorage::new(pool));
        storage.migrate().await?;

        Self::from_storage(config, storage, embedded_db).await
    }

    /// Builds the application against an already-provisioned pool, skipping
    /// `db::connect`/migration. Used by `#[sqlx::test]`-backed handler tests,
    /// which hand us a fresh per-test database with migrations already run.
    #[cfg(test)]
    pub async fn new_with_pool(config: Config, pool: sqlx::PgPool) -> anyhow::Result<Self> {
        let storage = Arc::new(PostgresStorage::new(pool));
        Self::from_storage(config, storage, None).await
    }

    async fn from_storage(config: Config, storage: Arc<PostgresStorage>, embedded_db: Option<EmbeddedDatabaseHandle>) -> anyhow::Result<Self> {
        let engine = Arc::new(Engine::new(storage, config.engine.clone()).await);
        engine.recover().await?;

        let shutdown_token = CancellationToken::new();
        let handles = engine.spawn_background_tasks(shutdown_token.clone());

        let state = AppState::new(engine.clone());
        let router = build_router(state, &config)?;

        Ok(Self { router, config, engine, shutdown_token, handles, _embedded_db: embedded_db })
    }

    /// Converts into an in-process `axum_test::TestServer`, bypassing the
    /// `serve`/graceful-shutdown lifecycle. Background loops (dispatch,
    /// health, cleanup) keep running detached for the server's lifetime.
    #[cfg(test)]
    pub fn into_test_server(self) -> axum_test::TestServer {
        axum_test::TestServer::new(self.router.into_make_service()).expect("failed to build test server")
    }

    /// Binds and serves until `shutdown` resolves, then cancels background
    /// tasks and waits for them to drain.
    pub async fn serve<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let bind_addr = self.config.bind_address();
        let listener = TcpListener::bind(&bind_addr).await?;
        info!("gateway listening on http://{}", bind_addr);

        axum::serve(listener, self.router.into_make_service()).with_graceful_shutdown(shutdown).await?;

        info!("shutting down background tasks");
        self.shutdown_token.cancel();
        self.handles.join().await;
        self.engine.shutdown_backends().await;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use gateway_core::config::{BackendConfig, EngineConfig, HttpProviderConfig, ProviderConfig};
    use serde_json::json;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::Application;
    use crate::config::{Config, DatabaseConfig};

    fn test_config(providers: HashMap<String, ProviderConfig>) -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            database_url: None,
            database: DatabaseConfig::External { url: "unused".to_string() },
            engine: EngineConfig { providers, ..EngineConfig::default() },
            cors_allowed_origins: vec!["*".to_string()],
            enable_otel_export: false,
        }
    }

    fn echo_provider(endpoint: String) -> ProviderConfig {
        ProviderConfig {
            enabled: true,
            priority: 50,
            timeout_s: 30,
            rate_limit_rpm: None,
            backend: BackendConfig::Http(HttpProviderConfig { endpoint, auth_header: None, model: None }),
        }
    }

    #[sqlx::test(migrations = "../gateway-core/migrations")]
    async fn ask_then_reply_round_trips_a_completed_response(pool: sqlx::PgPool) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "hi there"}))).mount(&mock_server).await;

        let mut providers = HashMap::new();
        providers.insert("echo".to_string(), echo_provider(mock_server.uri()));
        let config = test_config(providers);

        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let ask = server.post("/api/ask").json(&json!({"provider": "echo", "message": "hello", "priority": 50})).await;
        assert_eq!(ask.status_code(), 200, "ask should succeed");
        let ask_body: serde_json::Value = ask.json();
        assert_eq!(ask_body["status"], "queued");
        let request_id = ask_body["request_id"].as_str().unwrap().to_string();

        let reply = server.get(&format!("/api/reply/{request_id}?wait=true&timeout=5")).await;
        assert_eq!(reply.status_code(), 200, "reply should succeed");
        let reply_body: serde_json::Value = reply.json();
        assert_eq!(reply_body["status"], "completed");
        assert_eq!(reply_body["response"], "hi there");
    }

    #[sqlx::test(migrations = "../gateway-core/migrations")]
    async fn ask_rejects_unknown_provider(pool: sqlx::PgPool) {
        let config = test_config(HashMap::new());
        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let ask = server.post("/api/ask").json(&json!({"provider": "nope", "message": "hi"})).await;
        assert_eq!(ask.status_code(), 400);
    }

    #[sqlx::test(migrations = "../gateway-core/migrations")]
    async fn ask_past_max_queue_size_returns_503(pool: sqlx::PgPool) {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST")).respond_with(ResponseTemplate::new(200).set_body_json(json!({"response": "ok"}))).mount(&mock_server).await;

        let mut providers = HashMap::new();
        providers.insert("echo".to_string(), echo_provider(mock_server.uri()));
        let mut config = test_config(providers);
        config.engine.max_queue_size = 1;
        config.engine.max_concurrent_requests = 0; // no workers, so the queue never drains during the test

        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let first = server.post("/api/ask").json(&json!({"provider": "echo", "message": "one"})).await;
        assert_eq!(first.status_code(), 200, "first ask should fit within the queue");

        let second = server.post("/api/ask").json(&json!({"provider": "echo", "message": "two"})).await;
        assert_eq!(second.status_code(), 503);
    }

    #[sqlx::test(migrations = "../gateway-core/migrations")]
    async fn cancel_unknown_request_returns_404(pool: sqlx::PgPool) {
        let config = test_config(HashMap::new());
        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let cancel = server.delete("/api/request/000000000000").await;
        assert_eq!(cancel.status_code(), 404);
    }

    #[sqlx::test(migrations = "../gateway-core/migrations")]
    async fn providers_endpoint_lists_disabled_providers(pool: sqlx::PgPool) {
        let mut providers = HashMap::new();
        let mut disabled = echo_provider("http://127.0.0.1:1".to_string());
        disabled.enabled = false;
        providers.insert("disabled-echo".to_string(), disabled);
        let config = test_config(providers);

        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let providers_resp = server.get("/api/providers").await;
        assert_eq!(providers_resp.status_code(), 200, "providers listing should succeed");
        let body: serde_json::Value = providers_resp.json();
        let entries = body.as_array().expect("providers response should be an array");
        let entry = entries.iter().find(|p| p["name"] == "disabled-echo").expect("disabled provider should still be listed");
        assert_eq!(entry["enabled"], false);
    }

    #[sqlx::test(migrations = "../gateway-core/migrations")]
    async fn health_endpoint_reports_ok(pool: sqlx::PgPool) {
        let config = test_config(HashMap::new());
        let app = Application::new_with_pool(config, pool).await.expect("failed to build application");
        let server = app.into_test_server();

        let health = server.get("/api/health").await;
        assert_eq!(health.status_code(), 200, "health check should succeed");
        let body: serde_json::Value = health.json();
        assert_eq!(body["status"], "ok");
    }
}
