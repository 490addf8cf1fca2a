//! Session lifecycle endpoints.

use crate::error::{AppError, AppResult};
use crate::session::CallType;
use crate::state::AppState;
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CreateSessionRequest {
    pub call_type: String,
    /// Caller-supplied id; omitted means the server generates one.
    pub session_id: Option<String>,
    pub provider: Option<String>,
}

/// `POST /api/v1/sessions`
pub async fn create_session(
    state: web::Data<AppState>,
    body: web::Json<CreateSessionRequest>,
) -> AppResult<HttpResponse> {
    let body = body.into_inner();
    let call_type: CallType = body
        .call_type
        .parse()
        .map_err(AppError::ValidationError)?;

    let session = state
        .sessions
        .create(body.session_id, call_type, body.provider)
        .map_err(AppError::ValidationError)?;

    info!(
        session_id = %session.session_id,
        call_type = %session.call_type.as_str(),
        "Session created via API"
    );
    Ok(HttpResponse::Created().json(json!({
        "session": session,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// `GET /api/v1/sessions/{session_id}`
pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    let session = state
        .sessions
        .get(&session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", session_id)))?;

    Ok(HttpResponse::Ok().json(json!({
        "session": session,
        "connection_count": state.connections.connection_count(&session_id),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

/// `GET /api/v1/sessions/{session_id}/connections`
pub async fn session_connections(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> AppResult<HttpResponse> {
    let session_id = path.into_inner();
    if state.sessions.get(&session_id).is_none() {
        return Err(AppError::NotFound(format!(
            "Session '{}' not found",
            session_id
        )));
    }

    let connections = state.connections.session_connections(&session_id);
    Ok(HttpResponse::Ok().json(json!({
        "session_id": session_id,
        "connection_count": connections.len(),
        "connections": connections,
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}
