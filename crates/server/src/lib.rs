pub mod auth;
pub mod handler;
pub mod middleware;
pub mod pipeline;
pub mod rehydrate;

use axum::http::HeaderMap;
use axum::{Router, middleware as axum_mw};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use veil_core::config::Config;
use veil_core::keys::ApiKeyStore;
use veil_core::rate_limit::IpRateLimiter;
use veil_core::vault::Vault;
use veil_core::webhook::WebhookDispatcher;
use veil_detector::Detector;
use veil_guard::audit::SkillAuditor;
use veil_guard::{CanaryStore, OutputGuardrail, PromptGuard, SessionTracker};
use veil_provider::{ProviderRouter, UpstreamClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub detector: Arc<Detector>,
    pub vault: Arc<Vault>,
    pub keys: Arc<ApiKeyStore>,
    pub guard: Arc<PromptGuard>,
    pub canaries: Arc<CanaryStore>,
    pub tracker: Arc<SessionTracker>,
    pub guardrail: Arc<OutputGuardrail>,
    pub auditor: Arc<SkillAuditor>,
    pub limiter: Arc<IpRateLimiter>,
    pub webhooks: Option<Arc<WebhookDispatcher>>,
    pub upstream: Arc<UpstreamClient>,
    /// Present in router mode; absent in single-target mode.
    pub router: Option<Arc<ProviderRouter>>,
}

pub fn build_router(state: AppState) -> Router {
    // Utility endpoints sit outside the proxy chain.
    let utility = Router::new()
        .route("/health", axum::routing::get(handler::health::health))
        .route("/healthz", axum::routing::get(handler::health::health))
        .route("/scan", axum::routing::post(handler::scan::scan))
        .route("/audit", axum::routing::post(handler::audit::audit));

    // Everything else is proxied through the full chain. Layers run
    // outermost-last: rate-limit → auth → prompt-guard → role → screen.
    let proxied = Router::new()
        .fallback(pipeline::proxy)
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::security::security_screen,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::role::role_enforcement,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::prompt_guard::prompt_guard,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::rate_limit,
        ));

    Router::new()
        .merge(utility)
        .merge(proxied)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Session namespace for a request: `X-Session-ID`, then `X-Request-ID`,
/// then the shared default.
pub fn session_id(headers: &HeaderMap) -> String {
    for name in ["x-session-id", "x-request-id"] {
        if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok())
            && !value.is_empty()
        {
            return value.to_string();
        }
    }
    "default".to_string()
}

/// Client address for rate limiting: `X-Forwarded-For` (first hop),
/// `X-Real-IP`, then the socket address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok())
        && let Some(first) = forwarded.split(',').next()
        && !first.trim().is_empty()
    {
        return first.trim().to_string();
    }
    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok())
        && !real_ip.is_empty()
    {
        return real_ip.to_string();
    }
    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_session_id_fallback_chain() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_id(&headers), "default");

        headers.insert("x-request-id", HeaderValue::from_static("req-9"));
        assert_eq!(session_id(&headers), "req-9");

        headers.insert("x-session-id", HeaderValue::from_static("s1"));
        assert_eq!(session_id(&headers), "s1");
    }

    #[test]
    fn test_client_ip_priority() {
        let mut headers = HeaderMap::new();
        let peer: SocketAddr = "10.1.2.3:4444".parse().unwrap();

        assert_eq!(client_ip(&headers, Some(peer)), "10.1.2.3");

        headers.insert("x-real-ip", HeaderValue::from_static("172.16.0.9"));
        assert_eq!(client_ip(&headers, Some(peer)), "172.16.0.9");

        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        assert_eq!(client_ip(&headers, Some(peer)), "203.0.113.7");
    }
}
