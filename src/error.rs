// Gateway error taxonomy and its HTTP mapping

use axum::{
    extract::rejection::JsonRejection,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

pub type Result<T, E = GatewayError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    #[error("no API key configured for {0}")]
    MissingCredential(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("request body too large")]
    PayloadTooLarge,

    #[error("upstream returned {status}: {body}")]
    Upstream { status: u16, body: String },

    #[error("upstream transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("upstream stream error: {0}")]
    Stream(String),

    #[error("credential file error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

/// Lets the retry executor classify failures without knowing the concrete error.
pub trait RetryClassify {
    /// HTTP status attached to the failure, if one is known.
    fn status_code(&self) -> Option<u16>;

    fn is_retryable(&self) -> bool {
        !matches!(self.status_code(), Some(code) if (400..500).contains(&code))
    }
}

impl RetryClassify for GatewayError {
    fn status_code(&self) -> Option<u16> {
        match self {
            GatewayError::Upstream { status, .. } => Some(*status),
            GatewayError::Transport(e) => e.status().map(|s| s.as_u16()),
            GatewayError::UnknownProvider(_) | GatewayError::Validation(_) => Some(400),
            GatewayError::MissingCredential(_) => Some(401),
            GatewayError::PayloadTooLarge => Some(413),
            GatewayError::Stream(_) | GatewayError::Io(_) | GatewayError::Internal(_) => None,
        }
    }
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::UnknownProvider(_) => StatusCode::NOT_FOUND,
            GatewayError::MissingCredential(_) => StatusCode::UNAUTHORIZED,
            GatewayError::Validation(_) => StatusCode::BAD_REQUEST,
            GatewayError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            GatewayError::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Transport(_) | GatewayError::Stream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Io(_) | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::UnknownProvider(_)
            | GatewayError::Validation(_)
            | GatewayError::PayloadTooLarge => "invalid_request_error",
            GatewayError::MissingCredential(_) => "authentication_error",
            GatewayError::Upstream { .. } => "upstream_error",
            GatewayError::Transport(_) | GatewayError::Stream(_) => "api_error",
            GatewayError::Io(_) | GatewayError::Internal(_) => "internal_error",
        }
    }
}

impl From<JsonRejection> for GatewayError {
    fn from(rejection: JsonRejection) -> Self {
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            GatewayError::PayloadTooLarge
        } else {
            GatewayError::Validation(rejection.body_text())
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();

        // Upstream bodies are forwarded verbatim
        if let GatewayError::Upstream { body, .. } = &self {
            let content_type = if serde_json::from_str::<serde_json::Value>(body).is_ok() {
                "application/json"
            } else {
                "text/plain; charset=utf-8"
            };
            return (status, [(header::CONTENT_TYPE, content_type)], body.clone()).into_response();
        }

        let body = json!({
            "error": {
                "message": self.to_string(),
                "type": self.error_type(),
                "code": status.as_u16()
            }
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_errors_are_not_retryable() {
        for status in [404, 429] {
            let err = GatewayError::Upstream {
                status,
                body: String::new(),
            };
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn test_server_and_unknown_errors_are_retryable() {
        let err = GatewayError::Upstream {
            status: 503,
            body: String::new(),
        };
        assert!(err.is_retryable());
        assert!(GatewayError::Stream("reset".into()).is_retryable());
    }

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            GatewayError::MissingCredential("openai".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(GatewayError::PayloadTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let teapot = GatewayError::Upstream {
            status: 418,
            body: String::new(),
        };
        assert_eq!(teapot.status().as_u16(), 418);
    }
}
