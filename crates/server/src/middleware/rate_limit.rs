use crate::AppState;
use axum::extract::ConnectInfo;
use axum::{extract::State, http::Request, middleware::Next, response::Response};
use std::net::SocketAddr;

use veil_core::error::VeilError;

pub async fn rate_limit(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, VeilError> {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let ip = crate::client_ip(request.headers(), peer);

    let decision = state.limiter.check(&ip);
    if !decision.allowed {
        return Err(VeilError::RateLimited {
            retry_after: decision.retry_after,
        });
    }

    Ok(next.run(request).await)
}
