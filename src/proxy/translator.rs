// Request translator - turns a validated payload into the upstream HTTP request

use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde_json::Value;

use super::{AuthStyle, PayloadSchema, Provider};
use crate::error::{GatewayError, Result};

/// Fields a client may use to pass credentials inline; never forwarded.
const CREDENTIAL_FIELDS: [&str; 4] = ["apiKey", "apiUrl", "api_key", "api_url"];

const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Credentials lifted off an inbound payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestCredentials {
    pub api_key: Option<String>,
    pub api_url: Option<String>,
}

/// Remove every credential field from the payload, returning their values.
pub fn take_credentials(payload: &mut Value) -> RequestCredentials {
    let mut creds = RequestCredentials::default();
    let Some(obj) = payload.as_object_mut() else {
        return creds;
    };
    for field in CREDENTIAL_FIELDS {
        let value = obj
            .remove(field)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|v| !v.trim().is_empty());
        if value.is_none() {
            continue;
        }
        match field {
            "apiKey" | "api_key" => creds.api_key = creds.api_key.or(value),
            _ => creds.api_url = creds.api_url.or(value),
        }
    }
    creds
}

/// Where and as whom a request goes, resolved once per inbound call.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub provider: Provider,
    pub url: String,
    pub api_key: String,
    pub model: String,
}

impl UpstreamTarget {
    pub fn request(&self, payload: Value, stream: bool) -> Result<UpstreamRequest> {
        build_request(self.provider, &self.url, &self.api_key, &self.model, payload, stream)
    }

    /// Log/retry label, e.g. `openai/probe`.
    pub fn label(&self, phase: &str) -> String {
        format!("{}/{}", self.provider, phase)
    }
}

/// Fully-resolved upstream call.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
}

fn header_value(value: &str) -> Result<HeaderValue> {
    HeaderValue::from_str(value)
        .map_err(|_| {
            GatewayError::Validation("credential contains invalid header characters".into())
        })
}

fn auth_headers(style: AuthStyle, api_key: &str) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    match style {
        AuthStyle::Bearer => {
            headers.insert(AUTHORIZATION, header_value(&format!("Bearer {}", api_key))?);
        }
        AuthStyle::AnthropicKey => {
            headers.insert(HeaderName::from_static("x-api-key"), header_value(api_key)?);
            headers.insert(
                HeaderName::from_static("anthropic-version"),
                HeaderValue::from_static(ANTHROPIC_VERSION),
            );
        }
        AuthStyle::GoogleKey => {
            headers.insert(HeaderName::from_static("x-goog-api-key"), header_value(api_key)?);
        }
    }
    Ok(headers)
}

/// Gemini-native endpoint for `model`, e.g. `.../models/gemini-2.5-flash:generateContent`.
pub fn gemini_endpoint(base: &str, model: &str, stream: bool) -> String {
    let base = base.trim_end_matches('/');
    if stream {
        format!("{}/{}:streamGenerateContent?alt=sse", base, model)
    } else {
        format!("{}/{}:generateContent", base, model)
    }
}

/// Build the upstream request for `provider`.
///
/// Chat-message vendors get the payload as-is with the resolved model and
/// stream flag written in. Gemini-native vendors carry both in the URL
/// instead, so they are removed from the body.
pub fn build_request(
    provider: Provider,
    target_url: &str,
    api_key: &str,
    model: &str,
    mut payload: Value,
    stream: bool,
) -> Result<UpstreamRequest> {
    let descriptor = provider.descriptor();
    let headers = auth_headers(descriptor.auth, api_key)?;
    let obj = payload
        .as_object_mut()
        .ok_or_else(|| GatewayError::Validation("request body must be a JSON object".into()))?;

    let url = match descriptor.schema {
        PayloadSchema::ChatMessages => {
            obj.insert("model".into(), Value::String(model.to_string()));
            if stream {
                obj.insert("stream".into(), Value::Bool(true));
            } else if obj.contains_key("stream") {
                obj.insert("stream".into(), Value::Bool(false));
            }
            target_url.to_string()
        }
        PayloadSchema::GeminiContents => {
            obj.remove("model");
            obj.remove("stream");
            gemini_endpoint(target_url, model, stream)
        }
    };

    Ok(UpstreamRequest {
        url,
        headers,
        body: payload,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_take_credentials_strips_all_spellings() {
        let mut payload = json!({
            "model": "m",
            "apiKey": "k1",
            "api_key": "k2",
            "apiUrl": "https://u",
            "api_url": ""
        });
        let creds = take_credentials(&mut payload);
        assert_eq!(creds.api_key.as_deref(), Some("k1"));
        assert_eq!(creds.api_url.as_deref(), Some("https://u"));
        assert_eq!(payload, json!({"model": "m"}));
    }

    #[test]
    fn test_bearer_request() {
        let req = build_request(
            Provider::DeepSeek,
            "https://api.deepseek.com/chat/completions",
            "sk-1",
            "deepseek-chat",
            json!({"messages": [], "stream": true}),
            false,
        )
        .unwrap();
        assert_eq!(req.headers[AUTHORIZATION], "Bearer sk-1");
        assert_eq!(req.body["model"], "deepseek-chat");
        assert_eq!(req.body["stream"], false);
    }

    #[test]
    fn test_anthropic_headers() {
        let req = build_request(
            Provider::Anthropic,
            "https://api.anthropic.com/v1/messages",
            "ak",
            "claude",
            json!({"messages": []}),
            true,
        )
        .unwrap();
        assert_eq!(req.headers["x-api-key"], "ak");
        assert_eq!(req.headers["anthropic-version"], ANTHROPIC_VERSION);
        assert!(req.headers.get(AUTHORIZATION).is_none());
        assert_eq!(req.body["stream"], true);
    }

    #[test]
    fn test_gemini_model_moves_to_url() {
        let req = build_request(
            Provider::Google,
            "https://generativelanguage.googleapis.com/v1beta/models/",
            "gk",
            "gemini-2.5-flash",
            json!({"model": "x", "stream": true, "contents": []}),
            true,
        )
        .unwrap();
        assert_eq!(
            req.url,
            "https://generativelanguage.googleapis.com/v1beta/models/gemini-2.5-flash:streamGenerateContent?alt=sse"
        );
        assert_eq!(req.body, json!({"contents": []}));
        assert_eq!(req.headers["x-goog-api-key"], "gk");
    }

    #[test]
    fn test_invalid_key_rejected() {
        let err = build_request(Provider::OpenAI, "u", "bad\nkey", "m", json!({}), false)
            .unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);
    }
}
