//! `X-User-Role` validation and defaulting.
//!
//! Runs after auth, so a veil-key-bound role has already overwritten the
//! header and clients cannot escalate past their credential.

use crate::AppState;
use axum::http::HeaderValue;
use axum::{extract::State, http::Request, middleware::Next, response::Response};

use veil_core::error::VeilError;
use veil_core::keys::Role;

pub async fn role_enforcement(
    State(state): State<AppState>,
    mut request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, VeilError> {
    let role = match request
        .headers()
        .get("x-user-role")
        .and_then(|v| v.to_str().ok())
    {
        Some(raw) => raw
            .parse::<Role>()
            .map_err(|_| VeilError::Forbidden(format!("unknown role: {raw}")))?,
        None => {
            let default = state.config.default_role;
            if let Ok(value) = HeaderValue::from_str(default.as_str()) {
                request.headers_mut().insert("x-user-role", value);
            }
            default
        }
    };

    request.extensions_mut().insert(role);
    Ok(next.run(request).await)
}
