//! `/scan`: run the detector without anonymizing or touching the vault.

use crate::AppState;
use axum::Json;
use axum::extract::State;
use serde::Deserialize;
use serde_json::{Value, json};

use veil_core::error::VeilError;

#[derive(Deserialize)]
pub struct ScanRequest {
    pub text: String,
}

pub async fn scan(
    State(state): State<AppState>,
    Json(request): Json<ScanRequest>,
) -> Result<Json<Value>, VeilError> {
    let matches = state.detector.scan(&request.text);
    Ok(Json(json!({
        "count": matches.len(),
        "entities": matches,
    })))
}
