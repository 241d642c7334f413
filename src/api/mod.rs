// HTTP API Server module

use anyhow::Result;
use axum::{
    extract::DefaultBodyLimit,
    http::{Method, StatusCode},
    middleware,
    response::Response,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod cache;
pub mod gate;
mod handlers;
pub mod retry;
pub mod streaming;
pub mod upstream;

use crate::auth::CredentialStore;
use crate::config::GatewayConfig;
use crate::proxy::router::RequestRouter;
use crate::proxy::tools::ToolOrchestrator;
use cache::ResponseCache;
use gate::ConnectionGate;
use retry::RetryPolicy;
use upstream::UpstreamDispatcher;

/// Services shared by every handler. Built once at startup.
#[derive(Clone)]
pub struct AppState {
    pub router: Arc<RequestRouter>,
    pub credentials: Arc<CredentialStore>,
    pub cache: Arc<ResponseCache>,
    pub gate: Arc<ConnectionGate>,
}

impl AppState {
    pub fn new(config: &GatewayConfig, credentials: CredentialStore) -> crate::error::Result<Self> {
        let credentials = Arc::new(credentials);
        let cache = Arc::new(ResponseCache::new(
            config.cache.ttl(),
            config.cache.max_entries,
        ));
        let gate = Arc::new(ConnectionGate::new(config.max_connections));
        let upstream = Arc::new(UpstreamDispatcher::new(
            upstream::build_client(config)?,
            gate.clone(),
            RetryPolicy::from(&config.retry),
        ));
        let router = Arc::new(RequestRouter::new(
            credentials.clone(),
            cache.clone(),
            upstream,
            ToolOrchestrator::from_config(&config.time_tool),
        ));

        Ok(Self {
            router,
            credentials,
            cache,
            gate,
        })
    }
}

/// CORS preflights answer with `204 No Content`.
async fn preflight_no_content(method: Method, mut response: Response) -> Response {
    if method == Method::OPTIONS && response.status().is_success() {
        *response.status_mut() = StatusCode::NO_CONTENT;
    }
    response
}

pub fn build_router(state: AppState, body_limit_bytes: usize) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/api/health", get(handlers::health))
        .route("/api/providers", get(handlers::list_providers))
        .route("/api/save-env", post(handlers::save_env))
        .route("/api/save-memu-env", post(handlers::save_memu_env))
        .route("/api/:provider", post(handlers::chat))
        .fallback(handlers::not_found)
        .layer(DefaultBodyLimit::max(body_limit_bytes))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(middleware::map_response(preflight_no_content))
                .layer(cors),
        )
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves.
pub async fn start_server(
    config: &GatewayConfig,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let host = if config.host.is_empty() {
        "127.0.0.1"
    } else {
        &config.host
    };
    let addr = format!("{}:{}", host, config.port);
    let app = build_router(state, config.body_limit_mb.saturating_mul(1024 * 1024));

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Chat gateway listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    tracing::info!("Chat gateway stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    fn test_app(env_content: &str, body_limit: usize) -> (tempfile::TempDir, Router) {
        let dir = tempfile::tempdir().unwrap();
        let env = dir.path().join(".env");
        std::fs::write(&env, env_content).unwrap();
        let credentials = CredentialStore::load(&env).unwrap();
        let state = AppState::new(&GatewayConfig::default(), credentials).unwrap();
        (dir, build_router(state, body_limit))
    }

    fn post_json(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json(response: axum::response::Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_credential_is_401() {
        std::env::remove_var("ZHIPU_API_KEY");
        let (_dir, app) = test_app("", 1024 * 1024);
        let response = app
            .oneshot(post_json(
                "/api/zhipu",
                r#"{"messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = read_json(response).await;
        assert_eq!(body["error"]["code"], 401);
    }

    #[tokio::test]
    async fn test_unknown_provider_is_404() {
        let (_dir, app) = test_app("", 1024 * 1024);
        let response = app
            .oneshot(post_json("/api/not-a-vendor", r#"{"messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_malformed_json_is_400() {
        let (_dir, app) = test_app("OPENAI_API_KEY=k\n", 1024 * 1024);
        let response = app
            .oneshot(post_json("/api/openai", "{not json"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_oversized_body_is_413() {
        let (_dir, app) = test_app("OPENAI_API_KEY=k\n", 64);
        let big = format!(
            r#"{{"messages":[{{"role":"user","content":"{}"}}]}}"#,
            "x".repeat(256)
        );
        let response = app.oneshot(post_json("/api/openai", &big)).await.unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[tokio::test]
    async fn test_cors_preflight() {
        let (_dir, app) = test_app("", 1024 * 1024);
        let request = Request::builder()
            .method(Method::OPTIONS)
            .uri("/api/openai")
            .header("origin", "http://localhost:5173")
            .header("access-control-request-method", "POST")
            .body(Body::empty())
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert_eq!(response.headers()["access-control-allow-origin"], "*");
    }

    #[tokio::test]
    async fn test_save_env_round_trip() {
        let (dir, app) = test_app("", 1024 * 1024);

        let response = app
            .clone()
            .oneshot(post_json("/api/save-env", r#"{"provider":"bogus","apiKey":"k"}"#))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = app
            .clone()
            .oneshot(post_json(
                "/api/save-env",
                r#"{"provider":"moonshot","apiKey":"sk-moon","model":"kimi"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(
            body,
            json!({"ok": true, "updatedKeys": ["MOONSHOT_API_KEY", "MOONSHOT_MODEL"]})
        );

        let saved = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(saved.contains("MOONSHOT_API_KEY=sk-moon"));

        let response = app
            .oneshot(Request::get("/api/providers").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = read_json(response).await;
        let moonshot = body["providers"]
            .as_array()
            .unwrap()
            .iter()
            .find(|p| p["id"] == "moonshot")
            .unwrap()
            .clone();
        assert_eq!(moonshot["configured"], true);
        assert_eq!(moonshot["model"], "kimi");
    }

    #[tokio::test]
    async fn test_save_memu_env() {
        let (dir, app) = test_app("", 1024 * 1024);
        let response = app
            .oneshot(post_json(
                "/api/save-memu-env",
                r#"{"apiKey":"mu-1","baseUrl":"https://memu.local"}"#,
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let saved = std::fs::read_to_string(dir.path().join(".env")).unwrap();
        assert!(saved.contains("MEMU_API_KEY=mu-1"));
        assert!(saved.contains("MEMU_BASE_URL=https://memu.local"));
    }

    #[tokio::test]
    async fn test_health_reports_counters() {
        let (_dir, app) = test_app("", 1024 * 1024);
        let response = app
            .oneshot(Request::get("/api/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = read_json(response).await;
        assert_eq!(body["status"], "ok");
        assert_eq!(body["inFlight"], 0);
        assert_eq!(body["cacheEntries"], 0);
    }
}
