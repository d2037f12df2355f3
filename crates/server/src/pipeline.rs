//! The proxy request/response pipeline.
//!
//! Ingress: anonymize POST/PUT bodies, store the mapping in the vault,
//! optionally inject a canary. Dispatch: direct target or health-aware
//! router with fallback, with cross-shape adaptation for unified chat
//! requests. Egress: rehydrate (line-wise for SSE, whole-body otherwise),
//! then run the output guard and guardrail.

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{Method, Request, Response as HttpResponse};
use axum::response::Response;
use bytes::Bytes;
use serde_json::{Value, json};
use std::net::SocketAddr;

use crate::middleware::prompt_guard::BODY_HARD_CAP;
use crate::{AppState, rehydrate};
use veil_core::error::VeilError;
use veil_core::events::{Event, EventKind};
use veil_core::keys::Role;
use veil_guard::CanaryStore;
use veil_provider::adapt::{ProviderKind, adapt_request, adapt_response};
use veil_provider::sse::{MappingLoader, rehydrate_sse_stream};

/// Response headers never copied back to the client.
const SKIPPED_RESPONSE_HEADERS: &[&str] = &["content-length", "transfer-encoding", "connection"];

pub async fn proxy(
    State(state): State<AppState>,
    request: Request<Body>,
) -> Result<Response, VeilError> {
    let (parts, body) = request.into_parts();
    let method = parts.method.clone();
    if method == Method::CONNECT || method == Method::TRACE {
        return Err(VeilError::MethodNotAllowed);
    }

    let headers = parts.headers.clone();
    let session = crate::session_id(&headers);
    let role = parts
        .extensions
        .get::<Role>()
        .copied()
        .unwrap_or(state.config.default_role);

    // Per-session request window (output guardrail, request side).
    let peer = parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let tracker_key = headers
        .get("x-session-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| crate::client_ip(&headers, peer));
    if !state.tracker.allow(&tracker_key) {
        return Err(VeilError::RateLimited { retry_after: 60 });
    }

    let bytes = axum::body::to_bytes(body, BODY_HARD_CAP)
        .await
        .map_err(|e| VeilError::BadRequest(format!("cannot read body: {e}")))?;

    let outbound = anonymize_ingress(&state, &session, &method, bytes).await;

    // ── Dispatch ───────────────────────────────────────────────────────
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(str::to_string);

    let (upstream_response, adapted) = match &state.router {
        Some(router) => {
            let provider_header = headers
                .get("x-veil-provider")
                .and_then(|v| v.to_str().ok());
            let resolution = router.resolve(provider_header, &path)?;
            let kind = ProviderKind::detect(&resolution.provider.name, &resolution.provider.base_url);

            let mut forward_path = resolution.path.clone();
            let mut forward_body = outbound.clone();
            let mut adapted = None;

            // Unified chat requests are reshaped for non-OpenAI providers.
            if kind != ProviderKind::OpenAi
                && resolution.path.ends_with("/chat/completions")
                && let Ok(value) = serde_json::from_slice::<Value>(&outbound)
                && value.get("messages").is_some()
            {
                let native = adapt_request(&value, kind, resolution.provider.model.as_deref())?;
                let model = native
                    .get("model")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                forward_path = kind.chat_path(&model);
                forward_body = Bytes::from(serde_json::to_vec(&native)?);
                adapted = Some((kind, model));
            }

            if let Some(query) = &query {
                forward_path = format!("{forward_path}?{query}");
            }

            let (response, _provider) = state
                .upstream
                .dispatch_with_fallback(
                    router,
                    resolution.provider,
                    method,
                    &forward_path,
                    &headers,
                    forward_body,
                    state.webhooks.as_deref(),
                )
                .await?;
            (response, adapted)
        }
        None => {
            let target = state
                .config
                .target_url
                .as_deref()
                .ok_or_else(|| VeilError::Internal("no upstream target configured".into()))?;
            let full_path = match &query {
                Some(query) => format!("{path}?{query}"),
                None => path.clone(),
            };
            let response = state
                .upstream
                .send_direct(target, method, &full_path, &headers, outbound)
                .await?;
            (response, None)
        }
    };

    // ── Egress ─────────────────────────────────────────────────────────
    let status = upstream_response.status();
    let upstream_headers = upstream_response.headers().clone();
    let content_type = upstream_headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    if content_type.starts_with("text/event-stream") {
        let vault = state.vault.clone();
        let stream_session = session.clone();
        let loader: MappingLoader = Box::pin(async move {
            rehydrate::role_view(vault.lookup_all(&stream_session).await, role)
        });
        let stream = rehydrate_sse_stream(upstream_response.bytes_stream(), loader);

        let mut builder = HttpResponse::builder().status(status);
        for (name, value) in &upstream_headers {
            if !SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
                builder = builder.header(name, value);
            }
        }
        return builder
            .body(Body::from_stream(stream))
            .map_err(|e| VeilError::Internal(format!("response build failed: {e}")));
    }

    let body_bytes = upstream_response.bytes().await?;
    let final_body = match std::str::from_utf8(&body_bytes) {
        Ok(text) => {
            let text = match adapted {
                Some((kind, model)) if status.is_success() => {
                    match serde_json::from_str::<Value>(text) {
                        Ok(native) => adapt_response(&native, kind, &model)?.to_string(),
                        Err(_) => text.to_string(),
                    }
                }
                _ => text.to_string(),
            };

            let mappings = state.vault.lookup_all(&session).await;
            let rehydrated = rehydrate::rehydrate_text(&text, &mappings, role);
            screen_output(&state, &session, rehydrated)?
        }
        Err(_) => body_bytes,
    };

    let mut builder = HttpResponse::builder().status(status);
    for (name, value) in &upstream_headers {
        if !SKIPPED_RESPONSE_HEADERS.contains(&name.as_str()) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(final_body))
        .map_err(|e| VeilError::Internal(format!("response build failed: {e}")))
}

/// Anonymize a POST/PUT body within the size limit; store the mapping and
/// emit the detection event. Detector and vault trouble never fails the
/// request.
async fn anonymize_ingress(
    state: &AppState,
    session: &str,
    method: &Method,
    bytes: Bytes,
) -> Bytes {
    if *method != Method::POST && *method != Method::PUT || bytes.is_empty() {
        return bytes;
    }
    if bytes.len() > state.config.body_limit_bytes {
        tracing::warn!(
            size = bytes.len(),
            "body exceeds processing limit, forwarding unprocessed"
        );
        return bytes;
    }
    let Ok(text) = std::str::from_utf8(&bytes) else {
        return bytes;
    };

    let result = state.detector.anonymize(text);
    let mut outbound = if result.matches.is_empty() {
        text.to_string()
    } else {
        result.text
    };

    if !result.mapping.is_empty() {
        if let Err(e) = state.vault.store(session, &result.mapping).await {
            tracing::warn!("vault store failed, response will not rehydrate: {e}");
        }
        if let Some(webhooks) = &state.webhooks {
            let mut categories: Vec<&str> =
                result.matches.iter().map(|m| m.category.as_str()).collect();
            categories.sort_unstable();
            categories.dedup();
            webhooks.emit(Event::new(
                EventKind::PiiDetected,
                session,
                json!({
                    "count": result.matches.len(),
                    "categories": categories,
                }),
            ));
        }
    }

    if state.config.canary_enabled
        && let Ok(mut value) = serde_json::from_str::<Value>(&outbound)
        && inject_canary(&mut value, &state.canaries.issue(session))
    {
        outbound = value.to_string();
    }

    Bytes::from(outbound)
}

/// Wrap the invisible canary into the system turn, adding one if the
/// request has none.
fn inject_canary(value: &mut Value, token: &str) -> bool {
    let Some(messages) = value.get_mut("messages").and_then(Value::as_array_mut) else {
        return false;
    };

    for message in messages.iter_mut() {
        if message.get("role").and_then(Value::as_str) == Some("system")
            && let Some(Value::String(content)) = message.get_mut("content")
        {
            *content = CanaryStore::inject(content, token);
            return true;
        }
    }

    messages.insert(0, json!({"role": "system", "content": CanaryStore::inject("", token)}));
    true
}

/// Output-side screening: leak patterns and canaries, then content policy,
/// redaction, and the token cap.
fn screen_output(state: &AppState, session: &str, body: String) -> Result<Bytes, VeilError> {
    let scan = state.guard.scan_output(&body);
    let canary_hit = scan.detections.iter().any(|d| d.category == "data_leak");
    if canary_hit && let Some(webhooks) = &state.webhooks {
        webhooks.emit(Event::new(
            EventKind::CanaryLeaked,
            session,
            json!({"score": scan.score}),
        ));
    }
    if state.guard.should_block(&scan) {
        if let Some(webhooks) = &state.webhooks {
            webhooks.emit(Event::new(
                EventKind::GuardrailViolation,
                session,
                json!({
                    "threat": scan.threat.as_str(),
                    "detections": scan.detections,
                }),
            ));
        }
        return Err(VeilError::GuardrailViolation {
            message: "response blocked by output guard".to_string(),
            details: json!({
                "threat": scan.threat.as_str(),
                "detections": scan.detections,
            }),
        });
    }

    match state.guardrail.check(&body) {
        veil_guard::GuardrailOutcome::Blocked { message, details } => {
            if let Some(webhooks) = &state.webhooks {
                webhooks.emit(Event::new(
                    EventKind::GuardrailViolation,
                    session,
                    details.clone(),
                ));
            }
            Err(VeilError::GuardrailViolation { message, details })
        }
        veil_guard::GuardrailOutcome::Allowed { body: rewritten } => {
            Ok(Bytes::from(rewritten.unwrap_or(body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_canary_into_existing_system_turn() {
        let mut value = json!({
            "messages": [
                {"role": "system", "content": "be safe"},
                {"role": "user", "content": "hi"},
            ],
        });
        assert!(inject_canary(&mut value, "vura_canary_00ff"));
        let system = value["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("be safe"));
        assert!(system.contains("vura_canary_00ff"));
    }

    #[test]
    fn test_inject_canary_prepends_system_turn() {
        let mut value = json!({"messages": [{"role": "user", "content": "hi"}]});
        assert!(inject_canary(&mut value, "vura_canary_00ff"));
        assert_eq!(value["messages"][0]["role"], "system");
        assert_eq!(value["messages"][1]["role"], "user");
    }

    #[test]
    fn test_inject_canary_needs_messages() {
        let mut value = json!({"prompt": "hi"});
        assert!(!inject_canary(&mut value, "vura_canary_00ff"));
    }
}
