//! Bearer credential validation and role binding.
//!
//! Only veil-issued keys are validated here. Other bearer tokens belong to
//! the upstream provider: in router mode they are replaced by the
//! provider's own credential, in single-target mode they pass through
//! verbatim.

use crate::AppState;
use axum::http::HeaderValue;
use axum::{extract::State, http::Request, middleware::Next, response::Response};

use veil_core::error::VeilError;
use veil_core::keys::KEY_PREFIX;

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, VeilError> {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .or_else(|| {
            request
                .headers()
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
        })
        .map(str::to_string);

    if let Some(token) = token
        && token.starts_with(KEY_PREFIX)
    {
        let record = state
            .keys
            .validate(&token)
            .await?
            .ok_or_else(|| VeilError::Unauthorized("unknown API key".to_string()))?;

        // The bound role wins over whatever the client sent.
        let headers = request.headers_mut();
        if let Ok(role) = HeaderValue::from_str(record.role.as_str()) {
            headers.insert("x-user-role", role);
        }
        if let Ok(key_id) = HeaderValue::from_str(&record.id) {
            headers.insert("x-veil-key-id", key_id);
        }
        // The veil key is proxy-local; never forward it upstream.
        headers.remove("authorization");
        headers.remove("x-api-key");
    }

    Ok(next.run(request).await)
}
