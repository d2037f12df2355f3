use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for all proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum VeilError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("missing or invalid credential: {0}")]
    Unauthorized(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("rate limit exceeded, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },

    #[error("output guardrail violation: {message}")]
    GuardrailViolation {
        message: String,
        details: serde_json::Value,
    },

    #[error("prompt injection detected: {message}")]
    PromptInjection {
        message: String,
        threat: String,
        score: u32,
    },

    #[error("upstream error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("no healthy provider available")]
    NoHealthyProvider,

    #[error("all providers failed after {attempts} attempts")]
    AllProvidersFailed { attempts: u32 },

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("vault error: {0}")]
    Vault(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl VeilError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::GuardrailViolation { .. } | Self::PromptInjection { .. } => {
                StatusCode::FORBIDDEN
            }
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::NoHealthyProvider | Self::AllProvidersFailed { .. } => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            Self::Vault(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable error kind for the wire shape.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::RateLimited { .. } => "rate_limited",
            Self::GuardrailViolation { .. } => "guardrail_violation",
            Self::PromptInjection { .. } => "prompt_injection",
            Self::Upstream { .. } => "upstream_error",
            Self::NoHealthyProvider => "no_healthy_provider",
            Self::AllProvidersFailed { .. } => "all_providers_failed",
            Self::BadRequest(_) => "bad_request",
            Self::MethodNotAllowed => "method_not_allowed",
            Self::Vault(_) => "vault_error",
            Self::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for VeilError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = json!({
            "error": self.kind(),
            "message": self.to_string(),
        });

        match &self {
            Self::PromptInjection { threat, score, .. } => {
                body["type"] = json!("prompt_injection");
                body["threat"] = json!(threat);
                body["score"] = json!(score);
            }
            Self::GuardrailViolation { details, .. } => {
                body["details"] = details.clone();
            }
            _ => {}
        }

        let mut response = (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response();

        if let Self::RateLimited { retry_after } = &self
            && let Ok(value) = retry_after.to_string().parse()
        {
            response.headers_mut().insert("retry-after", value);
        }

        response
    }
}

impl From<reqwest::Error> for VeilError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Upstream {
                status: 504,
                body: format!("upstream timed out: {e}"),
            }
        } else {
            Self::Upstream {
                status: 502,
                body: e.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for VeilError {
    fn from(e: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            VeilError::Unauthorized("no key".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            VeilError::RateLimited { retry_after: 10 }.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            VeilError::NoHealthyProvider.status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            VeilError::Upstream {
                status: 503,
                body: String::new()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_kind_strings() {
        assert_eq!(VeilError::NoHealthyProvider.kind(), "no_healthy_provider");
        assert_eq!(
            VeilError::AllProvidersFailed { attempts: 3 }.kind(),
            "all_providers_failed"
        );
        assert_eq!(VeilError::MethodNotAllowed.kind(), "method_not_allowed");
    }
}
