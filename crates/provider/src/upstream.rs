//! Upstream dispatch: request building, credential injection, fallback.

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::{HeaderMap, HeaderValue};
use std::sync::Arc;
use std::time::Duration;

use crate::router::{Provider, ProviderRouter};
use veil_core::config::AuthMethod;
use veil_core::error::VeilError;
use veil_core::events::{Event, EventKind};
use veil_core::webhook::WebhookDispatcher;

/// Timeout for direct single-target dispatch; router mode uses the
/// per-provider setting.
const DIRECT_TIMEOUT: Duration = Duration::from_secs(300);

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
    "accept-encoding",
];

pub struct UpstreamClient {
    client: reqwest::Client,
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UpstreamClient {
    pub fn new() -> Self {
        // Timeouts are applied per request.
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_default();
        Self { client }
    }

    /// Forward to the fixed target. The client's own credential headers are
    /// passed through untouched; without a router there is nothing to
    /// replace them with.
    pub async fn send_direct(
        &self,
        target: &str,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, VeilError> {
        let url = join_url(target, path, None, None);
        let request = self
            .client
            .request(method, url)
            .headers(filter_headers(headers, false))
            .timeout(DIRECT_TIMEOUT)
            .body(body);
        Ok(request.send().await?)
    }

    /// Send to one provider, replacing client credentials with the
    /// provider's own by its configured auth method.
    pub async fn send_to_provider(
        &self,
        provider: &Provider,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<reqwest::Response, VeilError> {
        let query_auth = match provider.auth_method {
            AuthMethod::Query => provider
                .auth_param
                .as_deref()
                .map(|param| (param, provider.api_key.as_str())),
            _ => None,
        };
        let url = join_url(
            &provider.base_url,
            path,
            query_auth.map(|(p, _)| p),
            query_auth.map(|(_, k)| k),
        );

        let mut upstream_headers = filter_headers(headers, true);
        match provider.auth_method {
            AuthMethod::Header => {
                if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", provider.api_key)) {
                    upstream_headers.insert("authorization", value);
                }
            }
            AuthMethod::XApiKey => {
                if let Ok(value) = HeaderValue::from_str(&provider.api_key) {
                    upstream_headers.insert("x-api-key", value);
                }
            }
            AuthMethod::Query => {}
        }

        let request = self
            .client
            .request(method, url)
            .headers(upstream_headers)
            .timeout(provider.timeout)
            .body(body);
        Ok(request.send().await?)
    }

    /// Routed dispatch with health-aware fallback. Transport errors and 5xx
    /// mark the provider unhealthy and move on; 4xx and success return.
    pub async fn dispatch_with_fallback(
        &self,
        router: &ProviderRouter,
        first: Arc<Provider>,
        method: Method,
        path: &str,
        headers: &HeaderMap,
        body: Bytes,
        events: Option<&WebhookDispatcher>,
    ) -> Result<(reqwest::Response, Arc<Provider>), VeilError> {
        let fallback = router.fallback_config();

        let attempts: Vec<Arc<Provider>> = if fallback.enabled {
            router
                .fallback_order(&first)
                .into_iter()
                .take(fallback.max_attempts.max(1) as usize)
                .collect()
        } else {
            vec![first]
        };

        let total = attempts.len();
        let mut last_5xx: Option<(reqwest::Response, Arc<Provider>)> = None;

        'providers: for (index, provider) in attempts.into_iter().enumerate() {
            if index > 0 && fallback.retry_delay_sec > 0 {
                tokio::time::sleep(Duration::from_secs(fallback.retry_delay_sec)).await;
            }

            // Transport failures retry the same provider before falling over.
            for retry in 0..=provider.max_retries {
                match self
                    .send_to_provider(&provider, method.clone(), path, headers, body.clone())
                    .await
                {
                    Ok(response) if response.status().is_server_error() => {
                        report_unhealthy(&provider, response.status().as_u16(), events);
                        last_5xx = Some((response, provider));
                        continue 'providers;
                    }
                    Ok(response) => return Ok((response, provider)),
                    Err(e) => {
                        tracing::warn!(
                            "provider {} transport failure (attempt {}/{}, retry {retry}): {e}",
                            provider.name,
                            index + 1,
                            total,
                        );
                    }
                }
            }
            report_unhealthy(&provider, 0, events);
        }

        // 5xx after exhaustion is returned to the client as-is; pure
        // transport failure surfaces as all_providers_failed.
        match last_5xx {
            Some((response, provider)) => Ok((response, provider)),
            None => Err(VeilError::AllProvidersFailed {
                attempts: total as u32,
            }),
        }
    }
}

fn report_unhealthy(provider: &Provider, status: u16, events: Option<&WebhookDispatcher>) {
    provider.mark_unhealthy();
    if let Some(dispatcher) = events {
        dispatcher.emit(Event::new(
            EventKind::ProviderUnhealthy,
            "-",
            serde_json::json!({"provider": provider.name, "status": status}),
        ));
    }
}

/// Copy headers, dropping hop-by-hop fields. `strip_auth` removes client
/// credentials so the provider's own can be injected.
fn filter_headers(headers: &HeaderMap, strip_auth: bool) -> HeaderMap {
    let mut out = HeaderMap::new();
    for (name, value) in headers {
        let lower = name.as_str().to_ascii_lowercase();
        if HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if strip_auth && (lower == "authorization" || lower == "x-api-key") {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn join_url(base: &str, path: &str, auth_param: Option<&str>, auth_key: Option<&str>) -> String {
    let base = base.trim_end_matches('/');
    let mut url = format!("{base}{path}");
    if let (Some(param), Some(key)) = (auth_param, auth_key) {
        let separator = if url.contains('?') { '&' } else { '?' };
        url.push(separator);
        url.push_str(param);
        url.push('=');
        url.push_str(key);
    }
    url
}
