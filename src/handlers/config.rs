//! Runtime configuration endpoints.
//!
//! `GET` returns the live configuration; `PUT` applies a partial update.
//! Updates change what the config snapshot reports and what newly-created
//! components read; already-running flush loops keep the period they were
//! spawned with.

use crate::error::{AppError, AppResult};
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    let config = state.config.read().unwrap().clone();
    Ok(HttpResponse::Ok().json(json!({
        "config": config,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: String,
) -> AppResult<HttpResponse> {
    let mut config = state.config.write().unwrap();
    config
        .update_from_json(&body)
        .map_err(|e| AppError::ValidationError(e.to_string()))?;

    info!("Configuration updated via API");
    Ok(HttpResponse::Ok().json(json!({
        "message": "Configuration updated",
        "config": config.clone(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
