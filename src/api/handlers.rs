// API request handlers

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use serde_json::{json, Value};

use super::AppState;
use crate::auth::CredentialUpdate;
use crate::error::{GatewayError, Result};
use crate::proxy::router::Routed;
use crate::proxy::{PayloadSchema, Provider};

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Chat Gateway",
        "endpoints": [
            "POST /api/{provider}",
            "POST /api/save-env",
            "POST /api/save-memu-env",
            "GET /api/providers",
            "GET /api/health"
        ]
    }))
}

pub async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "inFlight": state.gate.in_flight(),
        "queued": state.gate.queued(),
        "maxConnections": state.gate.max_connections(),
        "cacheEntries": state.cache.len()
    }))
}

pub async fn list_providers(State(state): State<AppState>) -> Json<Value> {
    let providers: Vec<Value> = Provider::ALL
        .into_iter()
        .map(|provider| {
            let descriptor = provider.descriptor();
            json!({
                "id": descriptor.id,
                "path": descriptor.local_path,
                "configured": state.credentials.get_credential(provider).is_some(),
                "model": state.credentials.get_model(provider),
                "schema": match descriptor.schema {
                    PayloadSchema::ChatMessages => "messages",
                    PayloadSchema::GeminiContents => "contents",
                },
                "timeTool": descriptor.supports_time_tool
            })
        })
        .collect();
    Json(json!({ "providers": providers }))
}

pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": {"message": "Not found", "type": "invalid_request_error", "code": 404}
        })),
    )
        .into_response()
}

/// `POST /api/{provider}`
pub async fn chat(
    State(state): State<AppState>,
    Path(provider): Path<String>,
    payload: std::result::Result<Json<Value>, JsonRejection>,
) -> Result<Response> {
    let Json(payload) = payload?;
    match state.router.handle(&provider, payload).await? {
        Routed::Buffered(body) => Ok(Json(body).into_response()),
        Routed::Streaming(body) => Ok(sse_response(body)),
    }
}

fn sse_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE.as_str(), "text/event-stream"),
            (header::CACHE_CONTROL.as_str(), "no-cache"),
            (header::CONNECTION.as_str(), "keep-alive"),
            ("x-accel-buffering", "no"),
        ],
        body,
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct SaveEnvRequest {
    pub provider: String,
    #[serde(default, rename = "apiKey", alias = "api_key")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default, rename = "apiUrl", alias = "api_url")]
    pub api_url: Option<String>,
}

/// `POST /api/save-env`
pub async fn save_env(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SaveEnvRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) = payload?;
    let provider = Provider::resolve(&request.provider).ok_or_else(|| {
        GatewayError::Validation(format!("unknown provider: {}", request.provider))
    })?;

    let updated = state
        .credentials
        .set_credentials(
            provider,
            CredentialUpdate {
                api_key: request.api_key,
                model: request.model,
                api_url: request.api_url,
            },
        )
        .await?;
    Ok(Json(json!({ "ok": true, "updatedKeys": updated })))
}

#[derive(Debug, Deserialize)]
pub struct SaveMemuEnvRequest {
    #[serde(default, rename = "apiKey", alias = "api_key")]
    pub api_key: Option<String>,
    #[serde(default, rename = "baseUrl", alias = "base_url")]
    pub base_url: Option<String>,
}

/// `POST /api/save-memu-env`
pub async fn save_memu_env(
    State(state): State<AppState>,
    payload: std::result::Result<Json<SaveMemuEnvRequest>, JsonRejection>,
) -> Result<Json<Value>> {
    let Json(request) = payload?;
    let pairs: Vec<(String, String)> = [
        ("MEMU_API_KEY", request.api_key),
        ("MEMU_BASE_URL", request.base_url),
    ]
    .into_iter()
    .filter_map(|(key, value)| {
        let value = value?.trim().to_string();
        (!value.is_empty()).then(|| (key.to_string(), value))
    })
    .collect();
    if pairs.is_empty() {
        return Err(GatewayError::Validation("apiKey or baseUrl is required".into()));
    }

    let updated = state.credentials.set_values(&pairs).await?;
    Ok(Json(json!({ "ok": true, "updatedKeys": updated })))
}
