//! `/audit`: static skill-file lint; high-risk content is refused.

use crate::AppState;
use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use serde_json::json;

#[derive(Deserialize)]
pub struct AuditRequest {
    pub content: String,
}

pub async fn audit(State(state): State<AppState>, Json(request): Json<AuditRequest>) -> Response {
    let report = state.auditor.audit(&request.content);

    if report.blocking() {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({
                "error": "forbidden",
                "message": format!("skill content is {} risk", report.risk.as_str()),
                "details": report,
            })),
        )
            .into_response();
    }

    Json(json!({"risk": report.risk.as_str(), "findings": report.findings})).into_response()
}
