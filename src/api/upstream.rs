// Upstream dispatcher - every outbound vendor call goes through gate + retry here

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use super::gate::{ConnectionGate, GatePermit};
use super::retry::RetryPolicy;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::proxy::translator::UpstreamRequest;

pub struct UpstreamDispatcher {
    client: reqwest::Client,
    gate: Arc<ConnectionGate>,
    retry: RetryPolicy,
}

/// Shared HTTP client honouring the configured timeout and outbound proxy.
pub fn build_client(config: &GatewayConfig) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(Duration::from_secs(config.request_timeout_secs));
    if !config.proxy_url.trim().is_empty() {
        builder = builder.proxy(reqwest::Proxy::all(config.proxy_url.trim())?);
    }
    Ok(builder.build()?)
}

impl UpstreamDispatcher {
    pub fn new(client: reqwest::Client, gate: Arc<ConnectionGate>, retry: RetryPolicy) -> Self {
        Self {
            client,
            gate,
            retry,
        }
    }

    pub fn gate(&self) -> &ConnectionGate {
        &self.gate
    }

    /// One attempt. Non-2xx responses become `GatewayError::Upstream` so the
    /// retry executor can classify them.
    async fn send(&self, request: &UpstreamRequest) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(&request.url)
            .headers(request.headers.clone())
            .json(&request.body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(GatewayError::Upstream {
            status: status.as_u16(),
            body,
        })
    }

    /// Buffered call: gate slot per attempt, retried on 5xx/transport errors.
    pub async fn fetch_json(&self, label: &str, request: &UpstreamRequest) -> Result<Value> {
        self.retry
            .run(label, move || {
                self.gate.execute(move || async move {
                    let response = self.send(request).await?;
                    let text = response.text().await?;
                    serde_json::from_str(&text).map_err(|e| {
                        GatewayError::Stream(format!("upstream returned invalid JSON: {}", e))
                    })
                })
            })
            .await
            .inspect_err(|e| tracing::error!("[{}] upstream call failed: {}", label, e))
    }

    /// Open a streaming call. The returned permit must live as long as the
    /// body is being read; retries stop once the response headers arrive.
    pub async fn open_stream(
        &self,
        label: &str,
        request: &UpstreamRequest,
    ) -> Result<(reqwest::Response, GatePermit)> {
        self.retry
            .run(label, move || async move {
                let permit = self.gate.acquire().await?;
                let response = self.send(request).await?;
                Ok::<_, GatewayError>((response, permit))
            })
            .await
            .inspect_err(|e| tracing::error!("[{}] failed to open stream: {}", label, e))
    }
}
