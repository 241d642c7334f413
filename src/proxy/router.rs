// Request router - validates a chat request and picks the buffered, streaming or tool path

use axum::body::Body;
use reqwest::header::CONTENT_TYPE;
use serde_json::Value;
use std::sync::Arc;

use super::thinking::{self, StreamFilter};
use super::tools::{ToolOrchestrator, ToolOutcome};
use super::translator::{self, UpstreamTarget};
use super::{PayloadSchema, Provider};
use crate::api::cache::ResponseCache;
use crate::api::streaming;
use crate::api::upstream::UpstreamDispatcher;
use crate::auth::CredentialStore;
use crate::error::{GatewayError, Result};

/// What the caller gets back.
pub enum Routed {
    Buffered(Value),
    Streaming(Body),
}

impl std::fmt::Debug for Routed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Routed::Buffered(v) => f.debug_tuple("Buffered").field(v).finish(),
            Routed::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Per-request settings derived from the payload once validation passed.
struct CallPlan {
    target: UpstreamTarget,
    stream: bool,
    strip_thinking: bool,
}

pub struct RequestRouter {
    credentials: Arc<CredentialStore>,
    cache: Arc<ResponseCache>,
    upstream: Arc<UpstreamDispatcher>,
    tools: ToolOrchestrator,
}

impl RequestRouter {
    pub fn new(
        credentials: Arc<CredentialStore>,
        cache: Arc<ResponseCache>,
        upstream: Arc<UpstreamDispatcher>,
        tools: ToolOrchestrator,
    ) -> Self {
        Self {
            credentials,
            cache,
            upstream,
            tools,
        }
    }

    /// Handle `POST /api/{provider}`.
    pub async fn handle(&self, provider_id: &str, mut payload: Value) -> Result<Routed> {
        let provider = Provider::resolve(provider_id)
            .ok_or_else(|| GatewayError::UnknownProvider(provider_id.to_string()))?;
        if !payload.is_object() {
            return Err(GatewayError::Validation("request body must be a JSON object".into()));
        }

        // Credentials never travel further than this point
        let inline = translator::take_credentials(&mut payload);
        self.credentials.apply_request_override(
            provider,
            inline.api_key.as_deref(),
            inline.api_url.as_deref(),
        );

        let plan = self.plan(provider, &payload)?;
        tracing::info!(
            "[{}] model={} stream={} strip_thinking={}",
            provider,
            plan.target.model,
            plan.stream,
            plan.strip_thinking
        );

        match self
            .tools
            .run(&self.upstream, &plan.target, &payload, plan.stream)
            .await?
        {
            ToolOutcome::Completed(mut body) => {
                if plan.strip_thinking {
                    thinking::strip_buffered(&mut body);
                }
                return Ok(Routed::Buffered(body));
            }
            ToolOutcome::Stream(extended) => return self.stream_call(&plan, extended).await,
            ToolOutcome::Skipped => {}
        }

        if plan.stream {
            self.stream_call(&plan, payload).await
        } else {
            self.buffered_call(&plan, payload).await
        }
    }

    fn plan(&self, provider: Provider, payload: &Value) -> Result<CallPlan> {
        let descriptor = provider.descriptor();
        let api_key = self
            .credentials
            .get_credential(provider)
            .ok_or_else(|| GatewayError::MissingCredential(provider.to_string()))?;

        let body_field = match descriptor.schema {
            PayloadSchema::ChatMessages => "messages",
            PayloadSchema::GeminiContents => "contents",
        };
        if !payload.get(body_field).map(Value::is_array).unwrap_or(false) {
            return Err(GatewayError::Validation(format!("`{}` must be an array", body_field)));
        }

        let model = match payload.get("model") {
            None | Some(Value::Null) => self.credentials.get_model(provider),
            Some(Value::String(m)) if !m.trim().is_empty() => m.trim().to_string(),
            Some(_) => {
                return Err(GatewayError::Validation("`model` must be a non-empty string".into()))
            }
        };
        let stream = match payload.get("stream") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => return Err(GatewayError::Validation("`stream` must be a boolean".into())),
        };

        Ok(CallPlan {
            target: UpstreamTarget {
                provider,
                url: self.credentials.get_target_url(provider),
                api_key,
                model,
            },
            stream,
            strip_thinking: !thinking::is_thinking_requested(payload),
        })
    }

    async fn buffered_call(&self, plan: &CallPlan, payload: Value) -> Result<Routed> {
        let key = ResponseCache::key(plan.target.provider, &plan.target.model, &payload);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!("[{}] cache hit", plan.target.provider);
            return Ok(Routed::Buffered(hit));
        }

        let request = plan.target.request(payload, false)?;
        let mut body = self
            .upstream
            .fetch_json(&plan.target.label("buffered"), &request)
            .await?;
        if plan.strip_thinking {
            thinking::strip_buffered(&mut body);
        }
        self.cache.set(key, body.clone());
        Ok(Routed::Buffered(body))
    }

    async fn stream_call(&self, plan: &CallPlan, payload: Value) -> Result<Routed> {
        let request = plan.target.request(payload, true)?;
        let (response, permit) = self
            .upstream
            .open_stream(&plan.target.label("stream-open"), &request)
            .await?;

        // Some vendors answer a stream request with plain JSON
        let is_json = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|ct| ct.contains("application/json"))
            .unwrap_or(false);
        if is_json {
            let text = response.text().await?;
            drop(permit);
            let mut body: Value = serde_json::from_str(&text).map_err(|e| {
                GatewayError::Stream(format!("upstream returned invalid JSON: {}", e))
            })?;
            if plan.strip_thinking {
                thinking::strip_buffered(&mut body);
            }
            return Ok(Routed::Buffered(body));
        }

        let filter = plan.strip_thinking.then(StreamFilter::new);
        let relay = streaming::relay(
            response.bytes_stream(),
            filter,
            permit,
            plan.target.provider.to_string(),
        );
        Ok(Routed::Streaming(Body::from_stream(relay)))
    }
}
