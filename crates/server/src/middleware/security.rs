//! Header screen against shell-exfil smuggling.

use crate::AppState;
use axum::{extract::State, http::Request, middleware::Next, response::Response};

use veil_core::error::VeilError;

const SHELL_TOKENS: &[&str] = &[
    "curl ",
    "wget ",
    "nc ",
    "/etc/passwd",
    "/etc/shadow",
    "base64 -d",
    "eval(",
    "exec(",
];

pub async fn security_screen(
    State(_state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, VeilError> {
    for (name, value) in request.headers() {
        let Ok(value) = value.to_str() else { continue };
        let lowered = value.to_lowercase();
        if SHELL_TOKENS.iter().any(|token| lowered.contains(token)) {
            tracing::warn!("security screen rejected header {name}");
            return Err(VeilError::Forbidden(
                "request header contains a disallowed token".to_string(),
            ));
        }
    }
    Ok(next.run(request).await)
}
