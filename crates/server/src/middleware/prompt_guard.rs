//! Injection screening over client input.
//!
//! Buffers the request body, pulls out the user-authored text (system and
//! assistant turns are the client's own context, not an attack surface for
//! it), and blocks when the guard's threat meets the block threshold.
//! Lower threats are logged and allowed through with the body intact.

use crate::AppState;
use axum::body::Body;
use axum::{extract::State, http::Request, middleware::Next, response::Response};
use serde_json::Value;

use veil_core::error::VeilError;
use veil_core::events::{Event, EventKind};

/// Hard cap on buffered bodies; the configured limit governs processing,
/// this only protects the process.
pub const BODY_HARD_CAP: usize = 64 * 1024 * 1024;

pub async fn prompt_guard(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, VeilError> {
    let method = request.method().clone();
    if method != axum::http::Method::POST && method != axum::http::Method::PUT {
        return Ok(next.run(request).await);
    }

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, BODY_HARD_CAP)
        .await
        .map_err(|e| VeilError::BadRequest(format!("cannot read body: {e}")))?;

    // Oversize bodies skip scanning (and later anonymization).
    if bytes.len() <= state.config.body_limit_bytes
        && let Ok(text) = std::str::from_utf8(&bytes)
        && let Ok(value) = serde_json::from_str::<Value>(text)
    {
        let user_text = extract_user_text(&value);
        if !user_text.is_empty() {
            let result = state.guard.scan_input(&user_text);
            if state.guard.should_block(&result) {
                let session = crate::session_id(&parts.headers);
                if let Some(webhooks) = &state.webhooks {
                    webhooks.emit(Event::new(
                        EventKind::InjectionBlocked,
                        session,
                        serde_json::json!({
                            "score": result.score,
                            "threat": result.threat.as_str(),
                            "detections": result.detections,
                        }),
                    ));
                }
                return Err(VeilError::PromptInjection {
                    message: "request blocked by prompt-injection guard".to_string(),
                    threat: result.threat.as_str().to_string(),
                    score: result.score,
                });
            }
            if !result.detections.is_empty() {
                tracing::warn!(
                    score = result.score,
                    threat = result.threat.as_str(),
                    "prompt-injection signals below block threshold"
                );
            }
        }
    }

    let request = Request::from_parts(parts, Body::from(bytes));
    Ok(next.run(request).await)
}

/// User-authored text from the known request shapes: OpenAI `messages[]`
/// (string or multi-part content), `prompt`, and `input`.
fn extract_user_text(value: &Value) -> String {
    let mut parts: Vec<String> = Vec::new();

    if let Some(messages) = value.get("messages").and_then(Value::as_array) {
        for message in messages {
            if message.get("role").and_then(Value::as_str) != Some("user") {
                continue;
            }
            match message.get("content") {
                Some(Value::String(text)) => parts.push(text.clone()),
                Some(Value::Array(blocks)) => {
                    for block in blocks {
                        if let Some(text) = block.get("text").and_then(Value::as_str) {
                            parts.push(text.to_string());
                        }
                    }
                }
                _ => {}
            }
        }
    }

    for field in ["prompt", "input"] {
        match value.get(field) {
            Some(Value::String(text)) => parts.push(text.clone()),
            Some(Value::Array(items)) => {
                for item in items {
                    if let Some(text) = item.as_str() {
                        parts.push(text.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    parts.join("\n")
}
